use std::collections::VecDeque;
use std::num::NonZeroUsize;

use baton::{Frame, ParallelContext, StagePort, Tensor};
use log::debug;
use ndarray::{Array2, Axis, concatenate, s};

use crate::data::Batch;
use crate::engine::Engine;
use crate::error::{Result, TrainError};
use crate::schedule::{Schedule, StepResult};

/// Where a one-forward-one-backward step currently is.
///
/// A step opens in `Warmup` and issues forwards until the stage holds
/// enough micro-batches to keep its successors busy, then alternates one
/// forward with one backward in `Steady`, drains the remaining backwards
/// in `Cooldown` and ends in `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Steady,
    Cooldown,
    Done,
}

impl Phase {
    fn start(warmup: usize) -> Self {
        if warmup > 0 { Phase::Warmup } else { Phase::Steady }
    }

    /// The phase after one action, given how many forwards and backwards
    /// have run so far out of `m` micro-batches.
    fn advance(self, fwd: usize, bwd: usize, warmup: usize, m: usize) -> Self {
        match self {
            Phase::Warmup if fwd < warmup => Phase::Warmup,
            Phase::Warmup if fwd < m => Phase::Steady,
            Phase::Warmup => Phase::Cooldown,
            Phase::Steady if fwd < m => Phase::Steady,
            Phase::Steady if bwd < m => Phase::Cooldown,
            Phase::Cooldown if bwd < m => Phase::Cooldown,
            _ => Phase::Done,
        }
    }
}

/// How many forwards a stage runs before its first backward.
fn warmup_len(stage: usize, num_stages: usize, m: usize) -> usize {
    (num_stages - stage - 1).min(m)
}

/// The one-forward-one-backward pipeline schedule.
///
/// The batch is cut into `num_microbatches` equal slices. The first stage
/// feeds input slices into its model part and ships activations downstream;
/// the last stage runs the criterion per micro-batch and starts the
/// gradient flow back upstream. Keeping at most `num_stages - stage - 1`
/// micro-batches in flight bounds how many tapes a stage holds at once.
///
/// The schedule leaves every gradient seed unscaled; the engine averages
/// accumulated gradients over its backward calls at `step`, so a pipeline
/// step lands on the same batch-mean update as [`BatchSchedule`] would.
///
/// [`BatchSchedule`]: crate::schedule::BatchSchedule
pub struct PipelineSchedule<P> {
    ctx: ParallelContext,
    num_microbatches: NonZeroUsize,
    prev: Option<P>,
    next: Option<P>,
}

impl<P: StagePort> PipelineSchedule<P> {
    /// Wires a schedule to its neighbour stages.
    ///
    /// # Arguments
    /// * `ctx` - This rank's place in the stage grid.
    /// * `num_microbatches` - How many slices each batch is cut into.
    /// * `prev` - Link towards the earlier stage, `None` on the first.
    /// * `next` - Link towards the later stage, `None` on the last.
    ///
    /// # Errors
    /// Returns [`TrainError::Config`] when the ports present do not match
    /// the stage's position.
    pub fn new(
        ctx: ParallelContext,
        num_microbatches: NonZeroUsize,
        prev: Option<P>,
        next: Option<P>,
    ) -> Result<Self> {
        if ctx.has_prev() != prev.is_some() {
            return Err(TrainError::Config(format!(
                "stage {} of {} needs an upstream link: {}",
                ctx.stage(),
                ctx.num_stages(),
                ctx.has_prev()
            )));
        }
        if ctx.has_next() != next.is_some() {
            return Err(TrainError::Config(format!(
                "stage {} of {} needs a downstream link: {}",
                ctx.stage(),
                ctx.num_stages(),
                ctx.has_next()
            )));
        }

        Ok(Self {
            ctx,
            num_microbatches,
            prev,
            next,
        })
    }

    #[inline]
    pub fn num_microbatches(&self) -> NonZeroUsize {
        self.num_microbatches
    }

    #[inline]
    pub fn context(&self) -> &ParallelContext {
        &self.ctx
    }

    async fn send_next(&mut self, frame: Frame) -> Result<()> {
        match self.next.as_mut() {
            Some(port) => Ok(port.send(frame).await?),
            None => Err(TrainError::State("no downstream link on the last stage")),
        }
    }

    async fn send_prev(&mut self, frame: Frame) -> Result<()> {
        match self.prev.as_mut() {
            Some(port) => Ok(port.send(frame).await?),
            None => Err(TrainError::State("no upstream link on the first stage")),
        }
    }

    /// Waits for the activation of micro-batch `tag` from the earlier stage.
    async fn recv_activation(&mut self, tag: u32) -> Result<Array2<f32>> {
        let port = self
            .prev
            .as_mut()
            .ok_or(TrainError::State("no upstream link on the first stage"))?;

        match port.recv().await? {
            Frame::Activation(t) if t.tag == tag => tensor_into_array(t),
            Frame::Activation(t) => Err(TrainError::TagMismatch {
                expected: tag,
                got: t.tag,
            }),
            other => Err(TrainError::UnexpectedFrame {
                expected: "activation",
                got: other.kind_name().to_string(),
            }),
        }
    }

    /// Waits for the output gradient of micro-batch `tag` from the later stage.
    async fn recv_gradient(&mut self, tag: u32) -> Result<Array2<f32>> {
        let port = self
            .next
            .as_mut()
            .ok_or(TrainError::State("no downstream link on the last stage"))?;

        match port.recv().await? {
            Frame::Gradient(t) if t.tag == tag => tensor_into_array(t),
            Frame::Gradient(t) => Err(TrainError::TagMismatch {
                expected: tag,
                got: t.tag,
            }),
            other => Err(TrainError::UnexpectedFrame {
                expected: "gradient",
                got: other.kind_name().to_string(),
            }),
        }
    }

    /// Forwards micro-batch `tag` and, on the last stage, runs the criterion.
    async fn forward_micro<E: Engine>(
        &mut self,
        engine: &mut E,
        batch: &Batch<'_>,
        tag: u32,
        micro_rows: usize,
        outputs: &mut Vec<Array2<f32>>,
        losses: &mut Vec<f32>,
    ) -> Result<E::Tape> {
        let k = tag as usize;
        let (out, tape) = if self.ctx.is_first_stage() {
            let x = batch
                .input
                .slice(s![k * micro_rows..(k + 1) * micro_rows, ..]);
            engine.forward(x)?
        } else {
            let x = self.recv_activation(tag).await?;
            engine.forward(x.view())?
        };

        if self.ctx.is_last_stage() {
            let label = batch
                .label
                .slice(s![k * micro_rows..(k + 1) * micro_rows, ..]);
            losses.push(engine.criterion(out.view(), label)?);
            outputs.push(out);
        } else {
            self.send_next(Frame::Activation(tensor_from_array(tag, &out)))
                .await?;
        }

        Ok(tape)
    }

    /// Backwards the oldest in-flight micro-batch and ships its input
    /// gradient upstream.
    async fn backward_micro<E: Engine>(
        &mut self,
        engine: &mut E,
        in_flight: &mut VecDeque<(u32, E::Tape)>,
    ) -> Result<()> {
        let (tag, tape) = in_flight
            .pop_front()
            .ok_or(TrainError::State("backward with no micro-batch in flight"))?;

        let input_grad = if self.ctx.is_last_stage() {
            engine.backward(tape)?
        } else {
            let out_grad = self.recv_gradient(tag).await?;
            engine.backward_from(tape, out_grad)?
        };

        if !self.ctx.is_first_stage() {
            self.send_prev(Frame::Gradient(tensor_from_array(tag, &input_grad)))
                .await?;
        }

        Ok(())
    }

    /// Assembles the step result; only the last stage owns outputs and loss.
    fn collect(
        &self,
        batch: &Batch<'_>,
        outputs: Vec<Array2<f32>>,
        losses: Vec<f32>,
        samples: usize,
    ) -> Result<StepResult> {
        if !self.ctx.is_last_stage() {
            return Ok(StepResult {
                samples,
                ..StepResult::default()
            });
        }

        let views: Vec<_> = outputs.iter().map(|a| a.view()).collect();
        let output = concatenate(Axis(0), &views)
            .map_err(|_| TrainError::State("micro-batch outputs disagree on width"))?;
        let loss = losses.iter().sum::<f32>() / losses.len() as f32;

        Ok(StepResult {
            output: Some(output),
            label: Some(batch.label.to_owned()),
            loss: Some(loss),
            samples,
        })
    }
}

impl<E, P> Schedule<E> for PipelineSchedule<P>
where
    E: Engine,
    P: StagePort,
{
    async fn forward_backward_step(
        &mut self,
        engine: &mut E,
        batch: Batch<'_>,
        forward_only: bool,
    ) -> Result<StepResult> {
        let m = self.num_microbatches.get();
        let samples = batch.len();
        if samples % m != 0 {
            return Err(TrainError::Config(format!(
                "batch of {samples} rows cannot be cut into {m} equal micro-batches"
            )));
        }
        let micro_rows = samples / m;

        let mut outputs = Vec::new();
        let mut losses = Vec::new();

        if forward_only {
            for tag in 0..m as u32 {
                self.forward_micro(engine, &batch, tag, micro_rows, &mut outputs, &mut losses)
                    .await?;
            }
            return self.collect(&batch, outputs, losses, samples);
        }

        let warmup = warmup_len(self.ctx.stage(), self.ctx.num_stages(), m);
        debug!(
            stage = self.ctx.stage(),
            micro_batches = m,
            warmup = warmup;
            "pipeline step"
        );

        let mut in_flight: VecDeque<(u32, E::Tape)> = VecDeque::new();
        let mut fwd = 0;
        let mut bwd = 0;
        let mut phase = Phase::start(warmup);

        while phase != Phase::Done {
            match phase {
                Phase::Warmup => {
                    let tag = fwd as u32;
                    let tape = self
                        .forward_micro(engine, &batch, tag, micro_rows, &mut outputs, &mut losses)
                        .await?;
                    in_flight.push_back((tag, tape));
                    fwd += 1;
                }
                Phase::Steady => {
                    let tag = fwd as u32;
                    let tape = self
                        .forward_micro(engine, &batch, tag, micro_rows, &mut outputs, &mut losses)
                        .await?;
                    in_flight.push_back((tag, tape));
                    fwd += 1;

                    self.backward_micro(engine, &mut in_flight).await?;
                    bwd += 1;
                }
                Phase::Cooldown => {
                    self.backward_micro(engine, &mut in_flight).await?;
                    bwd += 1;
                }
                Phase::Done => unreachable!(),
            }
            phase = phase.advance(fwd, bwd, warmup, m);
        }

        self.collect(&batch, outputs, losses, samples)
    }
}

fn tensor_from_array(tag: u32, a: &Array2<f32>) -> Tensor {
    Tensor::new(tag, a.nrows(), a.ncols(), a.iter().copied().collect())
}

fn tensor_into_array(t: Tensor) -> Result<Array2<f32>> {
    Array2::from_shape_vec((t.rows, t.cols), t.data)
        .map_err(|_| TrainError::State("tensor does not match its header shape"))
}

#[cfg(test)]
mod tests {
    use baton::{ChanPort, SoloCollective};
    use ndarray::array;

    use super::*;
    use crate::engine::{Engine, ModuleEngine};
    use crate::schedule::BatchSchedule;
    use ensemble::{ActFn, Dense, Mse, Sequential, Sgd, seeded_params};

    /// Walks the phase machine and returns one letter per action.
    fn walk(warmup: usize, m: usize) -> String {
        let mut out = String::new();
        let (mut fwd, mut bwd) = (0, 0);
        let mut phase = Phase::start(warmup);
        while phase != Phase::Done {
            match phase {
                Phase::Warmup => {
                    out.push('w');
                    fwd += 1;
                }
                Phase::Steady => {
                    out.push('s');
                    fwd += 1;
                    bwd += 1;
                }
                Phase::Cooldown => {
                    out.push('c');
                    bwd += 1;
                }
                Phase::Done => unreachable!(),
            }
            phase = phase.advance(fwd, bwd, warmup, m);
        }
        assert_eq!(fwd, m, "every micro-batch must be forwarded");
        assert_eq!(bwd, m, "every micro-batch must be backwarded");
        out
    }

    #[test]
    fn phase_walk_covers_every_micro_batch() {
        assert_eq!(walk(0, 1), "s");
        assert_eq!(walk(0, 4), "ssss");
        assert_eq!(walk(1, 4), "wsssc");
        assert_eq!(walk(3, 4), "wwwsccc");
        assert_eq!(walk(4, 4), "wwwwcccc");
    }

    #[test]
    fn warmup_shrinks_towards_the_last_stage() {
        assert_eq!(warmup_len(0, 4, 8), 3);
        assert_eq!(warmup_len(2, 4, 8), 1);
        assert_eq!(warmup_len(3, 4, 8), 0);
        // Short batches cap the warmup.
        assert_eq!(warmup_len(0, 8, 2), 2);
    }

    #[test]
    fn ports_must_match_the_stage_position() {
        let (port, _peer) = baton::chan_pair();
        let solo = ParallelContext::solo();

        let got = PipelineSchedule::new(solo, NonZeroUsize::MIN, None, Some(port));
        assert!(matches!(got, Err(TrainError::Config(_))));
    }

    fn tiny_engine() -> ModuleEngine<Sgd, SoloCollective, Mse> {
        let model = Sequential::new(vec![
            Dense::new((2, 4), Some(ActFn::Relu)),
            Dense::new((4, 1), None),
        ])
        .unwrap();
        let params = seeded_params(&model, Some(11));
        let opt = Sgd::new(model.size(), 0.1, 0.0);
        ModuleEngine::new(model, params, Mse, opt, SoloCollective).unwrap()
    }

    /// A single-stage pipeline with two micro-batches must land on the same
    /// update as the plain schedule over the whole batch.
    #[tokio::test]
    async fn solo_pipeline_matches_the_plain_schedule() {
        let input = array![[0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [0.5, 0.5]];
        let label = array![[1.0], [1.0], [0.0], [0.5]];
        let batch = Batch {
            input: input.view(),
            label: label.view(),
        };

        let mut piped = tiny_engine();
        let mut schedule: PipelineSchedule<ChanPort> = PipelineSchedule::new(
            ParallelContext::solo(),
            NonZeroUsize::new(2).unwrap(),
            None,
            None,
        )
        .unwrap();
        piped.zero_grad();
        let piped_result = schedule
            .forward_backward_step(&mut piped, batch, false)
            .await
            .unwrap();
        piped.step().await.unwrap();

        let mut plain = tiny_engine();
        let mut batch_schedule = BatchSchedule::new();
        plain.zero_grad();
        let plain_result = batch_schedule
            .forward_backward_step(&mut plain, batch, false)
            .await
            .unwrap();
        plain.step().await.unwrap();

        let piped_loss = piped_result.loss.unwrap();
        let plain_loss = plain_result.loss.unwrap();
        assert!((piped_loss - plain_loss).abs() < 1e-5);

        for (a, b) in piped.params().iter().zip(plain.params()) {
            assert!((a - b).abs() < 1e-5, "parameters diverged: {a} vs {b}");
        }
    }

    #[tokio::test]
    async fn uneven_batches_are_rejected_before_any_traffic() {
        let input = array![[0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let label = array![[1.0], [1.0], [0.0]];

        let mut engine = tiny_engine();
        let mut schedule: PipelineSchedule<ChanPort> = PipelineSchedule::new(
            ParallelContext::solo(),
            NonZeroUsize::new(2).unwrap(),
            None,
            None,
        )
        .unwrap();

        engine.zero_grad();
        let got = schedule
            .forward_backward_step(
                &mut engine,
                Batch {
                    input: input.view(),
                    label: label.view(),
                },
                false,
            )
            .await;
        assert!(matches!(got, Err(TrainError::Config(_))));
    }
}
