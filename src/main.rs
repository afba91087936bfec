use std::env;
use std::num::NonZeroUsize;

use anyhow::Context;
use log::info;
use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};

use baton::{ChanPort, ParallelContext, SoloCollective, chan_pair};
use ensemble::{ActFn, Dense, Sequential, Sgd, SoftmaxCrossEntropy, seeded_params};
use maestro::hooks::{
    AccuracyHook, LogMetricByEpochHook, LogTimingByEpochHook, LossHook, LrSchedulerHook,
    ThroughputHook,
};
use maestro::{
    BatchSchedule, DataLoader, FitOptions, Hook, LinearWarmupLr, ModuleEngine, PipelineSchedule,
    TensorDataset, TensorLoader, Trainer,
};

type DemoEngine = ModuleEngine<Sgd, SoloCollective, SoftmaxCrossEntropy>;

/// Labels 2-D points by quadrant parity, a problem the hidden layer has to
/// earn.
fn synthetic_quadrants(samples: usize, seed: u64) -> TensorDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let inputs = Array2::from_shape_fn((samples, 2), |_| rng.random_range(-1.0..1.0f32));

    let classes: Vec<usize> = inputs
        .rows()
        .into_iter()
        .map(|row| usize::from((row[0] > 0.0) != (row[1] > 0.0)))
        .collect();
    let labels = TensorDataset::one_hot(&classes, 2);

    // SAFETY: inputs and labels were built row-for-row above.
    TensorDataset::new(inputs, labels).unwrap()
}

fn standard_hooks(epochs: usize, steps_per_epoch: usize) -> Vec<Box<dyn Hook<DemoEngine>>> {
    let scheduler = LinearWarmupLr::new(0.5, steps_per_epoch, steps_per_epoch * epochs);
    vec![
        Box::new(LossHook::new()),
        Box::new(AccuracyHook::new()),
        Box::new(ThroughputHook::new()),
        Box::new(LrSchedulerHook::new(scheduler, false)),
        Box::new(LogMetricByEpochHook::new()),
        Box::new(LogTimingByEpochHook::new(false)),
    ]
}

async fn solo(epochs: usize) -> anyhow::Result<()> {
    let model = Sequential::new(vec![
        Dense::new((2, 16), Some(ActFn::Relu)),
        Dense::new((16, 2), None),
    ])?;
    let params = seeded_params(&model, Some(42));
    let opt = Sgd::new(model.size(), 0.5, 0.9);
    let engine = ModuleEngine::new(model, params, SoftmaxCrossEntropy, opt, SoloCollective)?;

    let mut train_loader = TensorLoader::shuffled(synthetic_quadrants(512, 7), 32, 1)?;
    let mut test_loader = TensorLoader::new(synthetic_quadrants(128, 8), 32)?;
    let hooks = standard_hooks(epochs, train_loader.len());

    let mut trainer = Trainer::new(engine);
    let report = trainer
        .fit(
            &mut train_loader,
            Some(&mut test_loader),
            &mut BatchSchedule::new(),
            hooks,
            FitOptions {
                epochs,
                test_interval: 5,
                ..FitOptions::default()
            },
        )
        .await?;

    info!("fit finished: {report:?}");
    let accuracy = trainer.metrics().get("test/accuracy").unwrap_or_default();
    println!("test accuracy: {accuracy:.3}");
    Ok(())
}

/// Two pipeline stages in one process, linked by in-memory ports.
async fn pipelined(epochs: usize) -> anyhow::Result<()> {
    let model = Sequential::new(vec![
        Dense::new((2, 16), Some(ActFn::Relu)),
        Dense::new((16, 16), Some(ActFn::Relu)),
        Dense::new((16, 2), None),
    ])?;
    let mut parts = model.split_into(2)?.into_iter();
    let head = parts.next().context("missing head part")?;
    let tail = parts.next().context("missing tail part")?;

    let stages = NonZeroUsize::new(2).context("stage count")?;
    let micro = NonZeroUsize::new(4).context("micro-batch count")?;
    let (port_down, port_up) = chan_pair();

    let head_schedule = PipelineSchedule::new(
        ParallelContext::new(0, stages, 0, NonZeroUsize::MIN),
        micro,
        None,
        Some(port_down),
    )?;
    let tail_schedule = PipelineSchedule::new(
        ParallelContext::new(1, stages, 0, NonZeroUsize::MIN),
        micro,
        Some(port_up),
        None,
    )?;

    let first = tokio::spawn(run_stage(head, head_schedule, epochs));
    let last = tokio::spawn(run_stage(tail, tail_schedule, epochs));

    first.await??;
    let accuracy = last.await??;
    println!("test accuracy: {accuracy:.3}");
    Ok(())
}

async fn run_stage(
    part: Sequential,
    mut schedule: PipelineSchedule<ChanPort>,
    epochs: usize,
) -> anyhow::Result<f64> {
    let stage = schedule.context().stage();
    let params = seeded_params(&part, Some(42 + stage as u64));
    let opt = Sgd::new(part.size(), 0.5, 0.9);
    let engine = ModuleEngine::new(part, params, SoftmaxCrossEntropy, opt, SoloCollective)?;

    // Every stage walks the same batches; inputs matter on the first
    // stage, labels on the last.
    let mut train_loader = TensorLoader::shuffled(synthetic_quadrants(512, 7), 32, 1)?;
    let mut test_loader = TensorLoader::new(synthetic_quadrants(128, 8), 32)?;
    let hooks = if schedule.context().is_last_stage() {
        standard_hooks(epochs, train_loader.len())
    } else {
        Vec::new()
    };

    let mut trainer = Trainer::new(engine);
    let report = trainer
        .fit(
            &mut train_loader,
            Some(&mut test_loader),
            &mut schedule,
            hooks,
            FitOptions {
                epochs,
                test_interval: 5,
                ..FitOptions::default()
            },
        )
        .await?;

    info!(stage = stage; "fit finished: {report:?}");
    Ok(trainer.metrics().get("test/accuracy").unwrap_or_default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let stages: usize = env::var("STAGES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let epochs: usize = env::var("EPOCHS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    match stages {
        1 => solo(epochs).await,
        2 => pipelined(epochs).await,
        n => anyhow::bail!("STAGES must be 1 or 2, got {n}"),
    }
}
