//! The seam between the training loop and whatever computes gradients.

mod module;

pub use module::ModuleEngine;

use ndarray::{Array2, ArrayView2};

use crate::error::Result;

/// Everything an engine must persist to resume training exactly where it
/// stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub params: Vec<f32>,
    pub opt_state: Vec<Vec<f32>>,
}

/// One rank's training engine: parameters, gradient accumulation and the
/// optimizer behind a narrow seam.
///
/// The call protocol per optimizer step is `zero_grad`, then one or more
/// forward/backward rounds, then `step`. A loss-owning stage seeds each
/// backward pass through `criterion`; upstream stages seed theirs with the
/// gradient received from downstream via `backward_from`. At `step` the
/// accumulated gradient is divided by the number of backward calls since
/// `zero_grad`, so the update is the batch mean no matter how the batch
/// was sliced into micro-batches or accumulation rounds.
#[trait_variant::make(Engine: Send)]
pub trait LocalEngine {
    /// Per-forward state carried to the matching backward call.
    type Tape: Send;

    /// Clears accumulated gradients and the backward-call counter.
    fn zero_grad(&mut self);

    /// Computes the model output for `input`.
    fn forward(&mut self, input: ArrayView2<f32>) -> Result<(Array2<f32>, Self::Tape)>;

    /// Computes the loss and caches its gradient as the seed for the next
    /// `backward` call.
    fn criterion(&mut self, output: ArrayView2<f32>, label: ArrayView2<f32>) -> Result<f32>;

    /// Runs the backward pass seeded by the pending `criterion` gradient.
    ///
    /// # Returns
    /// The gradient w.r.t. the forward input.
    fn backward(&mut self, tape: Self::Tape) -> Result<Array2<f32>>;

    /// Runs the backward pass seeded by a downstream gradient.
    fn backward_from(&mut self, tape: Self::Tape, out_grad: Array2<f32>) -> Result<Array2<f32>>;

    /// Applies one optimizer update over the accumulated gradients,
    /// averaging them across the tensor-parallel group first.
    async fn step(&mut self) -> Result<()>;

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);

    /// The number of parameters this engine trains.
    fn num_params(&self) -> usize;

    fn state(&self) -> EngineState;

    fn load_state(&mut self, state: &EngineState) -> Result<()>;
}
