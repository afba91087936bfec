//! A full grid run: two pipeline stages, two tensor replicas per stage.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::future;
use ndarray::Array2;

use baton::{ChanPort, MeshCollective, ParallelContext, chan_pair};
use ensemble::{ActFn, Dense, Sequential, Sgd, SoftmaxCrossEntropy, seeded_params};
use maestro::{
    Engine, FitOptions, FitReport, Hook, HookCtx, ModuleEngine, PipelineSchedule, Result,
    StopReason, TensorDataset, TensorLoader, Trainer,
};

type GridEngine = ModuleEngine<Sgd, MeshCollective, SoftmaxCrossEntropy>;

const SAMPLES: usize = 40;
const BATCH_ROWS: usize = 4;
const MICRO: usize = 4;
const MAX_STEPS: usize = 5;

fn full_model() -> Sequential {
    Sequential::new(vec![
        Dense::new((3, 8), Some(ActFn::Relu)),
        Dense::new((8, 8), Some(ActFn::Relu)),
        Dense::new((8, 8), Some(ActFn::Relu)),
        Dense::new((8, 4), None),
    ])
    .unwrap()
}

fn loader() -> TensorLoader {
    let input = Array2::from_shape_fn((SAMPLES, 3), |(i, j)| ((i * 3 + j) as f32 * 0.23).cos());
    let classes: Vec<usize> = (0..SAMPLES).map(|i| i % 4).collect();
    let label = TensorDataset::one_hot(&classes, 4);

    TensorLoader::new(TensorDataset::new(input, label).unwrap(), BATCH_ROWS).unwrap()
}

#[derive(Clone, Default)]
struct Counters {
    iters: Arc<Mutex<usize>>,
    epochs: Arc<Mutex<usize>>,
    evals: Arc<Mutex<usize>>,
}

struct CountHook {
    counts: Counters,
}

impl<E: Engine> Hook<E> for CountHook {
    fn after_train_iter(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        *self.counts.iters.lock().unwrap() += 1;
        Ok(())
    }

    fn after_train_epoch(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        *self.counts.epochs.lock().unwrap() += 1;
        Ok(())
    }

    fn before_test(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        *self.counts.evals.lock().unwrap() += 1;
        Ok(())
    }
}

async fn run_rank(
    ctx: ParallelContext,
    part: Sequential,
    params: Vec<f32>,
    collective: MeshCollective,
    prev: Option<ChanPort>,
    next: Option<ChanPort>,
    counts: Counters,
) -> Result<(FitReport, Vec<f32>)> {
    let opt = Sgd::new(part.size(), 0.1, 0.0);
    let engine = ModuleEngine::new(part, params, SoftmaxCrossEntropy, opt, collective)?;
    let mut trainer = Trainer::new(engine);
    let mut schedule = PipelineSchedule::new(ctx, NonZeroUsize::new(MICRO).unwrap(), prev, next)?;

    let hooks: Vec<Box<dyn Hook<GridEngine>>> = vec![Box::new(CountHook { counts })];

    let mut train = loader();
    let mut test = loader();
    let report = trainer
        .fit(
            &mut train,
            Some(&mut test),
            &mut schedule,
            hooks,
            FitOptions {
                epochs: 60,
                test_interval: 1,
                max_steps: Some(MAX_STEPS),
                grad_accum: NonZeroUsize::new(2).unwrap(),
                ..FitOptions::default()
            },
        )
        .await?;

    Ok((report, trainer.engine().params().to_vec()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_two_by_two_grid_stops_at_the_step_cap() {
    let stages = NonZeroUsize::new(2).unwrap();
    let tp = NonZeroUsize::new(2).unwrap();

    let model = full_model();
    let mut parts = model.split_into(2).unwrap().into_iter();
    let head = parts.next().unwrap();
    let tail = parts.next().unwrap();

    let head_params = seeded_params(&head, Some(21));
    let tail_params = seeded_params(&tail, Some(22));

    let mut head_group = MeshCollective::group(tp).into_iter();
    let mut tail_group = MeshCollective::group(tp).into_iter();

    let mut tasks = Vec::new();
    let mut all_counts = Vec::new();

    // Ranks land in task order head/tail for tp 0, then head/tail for tp 1.
    for tp_rank in 0..2 {
        let (down, up) = chan_pair();

        let counts = Counters::default();
        all_counts.push(counts.clone());
        let ctx = ParallelContext::new(0, stages, tp_rank, tp);
        tasks.push(tokio::spawn(run_rank(
            ctx,
            head.clone(),
            head_params.clone(),
            head_group.next().unwrap(),
            None,
            Some(down),
            counts,
        )));

        let counts = Counters::default();
        all_counts.push(counts.clone());
        let ctx = ParallelContext::new(1, stages, tp_rank, tp);
        tasks.push(tokio::spawn(run_rank(
            ctx,
            tail.clone(),
            tail_params.clone(),
            tail_group.next().unwrap(),
            Some(up),
            None,
            counts,
        )));
    }

    let mut reports = Vec::new();
    let mut params = Vec::new();
    for outcome in future::try_join_all(tasks).await.unwrap() {
        let (report, p) = outcome.unwrap();
        reports.push(report);
        params.push(p);
    }

    // Ten batches per epoch at accumulation two make five steps, so the cap
    // lands exactly on the first epoch boundary.
    for report in &reports {
        assert_eq!(report.steps_run, MAX_STEPS);
        assert_eq!(report.stop, StopReason::MaxSteps);
        assert_eq!(report.epochs_run, 1);
    }

    for counts in &all_counts {
        assert_eq!(*counts.iters.lock().unwrap(), MAX_STEPS);
        assert_eq!(*counts.epochs.lock().unwrap(), 1);
        assert_eq!(
            *counts.evals.lock().unwrap(),
            0,
            "the stop must skip evaluation"
        );
    }

    // Tensor replicas of one stage must end bit-identical.
    assert_eq!(params[0], params[2], "head replicas diverged");
    assert_eq!(params[1], params[3], "tail replicas diverged");
}
