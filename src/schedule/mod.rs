//! How one training step walks a batch through the engine.

mod batch;
mod pipeline;

pub use batch::BatchSchedule;
pub use pipeline::{Phase, PipelineSchedule};

use ndarray::Array2;

use crate::data::Batch;
use crate::engine::Engine;
use crate::error::Result;

/// What one schedule step hands back to the trainer.
///
/// Only the loss-owning stage fills `output`, `label` and `loss`; other
/// pipeline stages report the sample count alone.
#[derive(Debug, Default)]
pub struct StepResult {
    pub output: Option<Array2<f32>>,
    pub label: Option<Array2<f32>>,
    pub loss: Option<f32>,
    pub samples: usize,
}

/// A strategy for running the forward and backward passes of one batch.
///
/// `forward_only` skips all gradient work; evaluation passes use it. The
/// schedule never calls `Engine::zero_grad` or `Engine::step`, those stay
/// with the trainer so several schedule calls can share one optimizer
/// update.
#[trait_variant::make(Schedule: Send)]
pub trait LocalSchedule<E: Engine> {
    async fn forward_backward_step(
        &mut self,
        engine: &mut E,
        batch: Batch<'_>,
        forward_only: bool,
    ) -> Result<StepResult>;
}
