use baton::Collective;
use ensemble::{LossFn, Optimizer, Sequential, Tape};
use ndarray::{Array2, ArrayView2};

use super::{Engine, EngineState};
use crate::error::{Result, TrainError};

/// The provided engine over an `ensemble` model.
///
/// Owns the flat parameter and gradient buffers plus the optimizer; the
/// collective keeps tensor-parallel replicas in lockstep by averaging
/// gradients right before every optimizer update.
pub struct ModuleEngine<O, C, L> {
    model: Sequential,
    params: Vec<f32>,
    grads: Vec<f32>,
    opt: O,
    loss_fn: L,
    collective: C,
    pending_seed: Option<Array2<f32>>,
    backward_calls: usize,
}

impl<O, C, L> ModuleEngine<O, C, L> {
    /// Creates a new `ModuleEngine`.
    ///
    /// # Arguments
    /// * `model` - The (sub)model this rank computes.
    /// * `params` - The initial flat parameter buffer.
    /// * `loss_fn` - The objective, consulted only on loss-owning stages.
    /// * `opt` - The update rule.
    /// * `collective` - This rank's tensor-parallel group peer.
    ///
    /// # Errors
    /// Rejects a parameter buffer that does not match the model layout.
    pub fn new(model: Sequential, params: Vec<f32>, loss_fn: L, opt: O, collective: C) -> Result<Self> {
        if params.len() != model.size() {
            return Err(TrainError::Config(format!(
                "parameter buffer holds {} values, the model needs {}",
                params.len(),
                model.size()
            )));
        }

        let grads = vec![0.0; params.len()];

        Ok(Self {
            model,
            params,
            grads,
            opt,
            loss_fn,
            collective,
            pending_seed: None,
            backward_calls: 0,
        })
    }

    /// The current flat parameters, for assertions and persistence.
    #[inline]
    pub fn params(&self) -> &[f32] {
        &self.params
    }
}

impl<O, C, L> Engine for ModuleEngine<O, C, L>
where
    O: Optimizer,
    C: Collective,
    L: LossFn,
{
    type Tape = Tape;

    fn zero_grad(&mut self) {
        self.grads.fill(0.0);
        self.pending_seed = None;
        self.backward_calls = 0;
    }

    fn forward(&mut self, input: ArrayView2<f32>) -> Result<(Array2<f32>, Tape)> {
        Ok(self.model.forward(&self.params, input)?)
    }

    fn criterion(&mut self, output: ArrayView2<f32>, label: ArrayView2<f32>) -> Result<f32> {
        let loss = self.loss_fn.loss(output, label);
        self.pending_seed = Some(self.loss_fn.loss_prime(output, label));
        Ok(loss)
    }

    fn backward(&mut self, tape: Tape) -> Result<Array2<f32>> {
        let seed = self
            .pending_seed
            .take()
            .ok_or(TrainError::State("backward without a pending criterion"))?;

        let input_grad = self.model.backward(&self.params, &mut self.grads, tape, seed)?;
        self.backward_calls += 1;
        Ok(input_grad)
    }

    fn backward_from(&mut self, tape: Tape, out_grad: Array2<f32>) -> Result<Array2<f32>> {
        let input_grad = self
            .model
            .backward(&self.params, &mut self.grads, tape, out_grad)?;
        self.backward_calls += 1;
        Ok(input_grad)
    }

    async fn step(&mut self) -> Result<()> {
        let calls = self.backward_calls;

        if calls == 0 {
            return Err(TrainError::State("step without accumulated gradients"));
        }

        if calls > 1 {
            let inv = 1.0 / calls as f32;
            for g in &mut self.grads {
                *g *= inv;
            }
        }

        self.collective.all_reduce_mean(&mut self.grads).await?;
        self.opt.update_params(&mut self.params, &self.grads)?;
        self.backward_calls = 0;

        Ok(())
    }

    fn lr(&self) -> f32 {
        self.opt.lr()
    }

    fn set_lr(&mut self, lr: f32) {
        self.opt.set_lr(lr);
    }

    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn state(&self) -> EngineState {
        EngineState {
            params: self.params.clone(),
            opt_state: self.opt.state(),
        }
    }

    fn load_state(&mut self, state: &EngineState) -> Result<()> {
        if state.params.len() != self.params.len() {
            return Err(TrainError::Config(format!(
                "restored parameter buffer holds {} values, the model needs {}",
                state.params.len(),
                self.params.len()
            )));
        }

        self.params.copy_from_slice(&state.params);
        self.opt.load_state(&state.opt_state)?;
        self.zero_grad();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton::SoloCollective;
    use ensemble::{ActFn, Dense, Sgd, SoftmaxCrossEntropy, seeded_params};
    use ndarray::array;

    fn engine() -> ModuleEngine<Sgd, SoloCollective, SoftmaxCrossEntropy> {
        let model = Sequential::new([
            Dense::new((2, 4), Some(ActFn::Relu)),
            Dense::new((4, 2), None),
        ])
        .unwrap();

        let params = seeded_params(&model, Some(11));
        let opt = Sgd::new(model.size(), 0.1, 0.0);

        ModuleEngine::new(model, params, SoftmaxCrossEntropy, opt, SoloCollective).unwrap()
    }

    fn batch() -> (Array2<f32>, Array2<f32>) {
        (
            array![[0.5, -1.0], [1.5, 0.25], [-0.75, 2.0], [0.1, 0.9]],
            array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]],
        )
    }

    #[tokio::test]
    async fn backward_requires_a_criterion_seed() {
        let mut engine = engine();
        let (x, _) = batch();

        engine.zero_grad();
        let (_, tape) = engine.forward(x.view()).unwrap();

        let err = engine.backward(tape).unwrap_err();
        assert!(matches!(err, TrainError::State(_)));
    }

    #[tokio::test]
    async fn step_requires_gradients() {
        let mut engine = engine();
        engine.zero_grad();

        let err = engine.step().await.unwrap_err();
        assert!(matches!(err, TrainError::State(_)));
    }

    #[tokio::test]
    async fn split_backwards_average_to_the_full_batch_gradient() {
        let (x, y) = batch();

        // One pass over the whole batch.
        let mut whole = engine();
        whole.zero_grad();
        let (out, tape) = whole.forward(x.view()).unwrap();
        whole.criterion(out.view(), y.view()).unwrap();
        whole.backward(tape).unwrap();
        whole.step().await.unwrap();

        // Two passes over the halves, one optimizer step.
        let mut halved = engine();
        halved.zero_grad();
        for range in [0..2, 2..4] {
            let xs = x.slice(ndarray::s![range.clone(), ..]);
            let ys = y.slice(ndarray::s![range, ..]);

            let (out, tape) = halved.forward(xs).unwrap();
            halved.criterion(out.view(), ys.view()).unwrap();
            halved.backward(tape).unwrap();
        }
        halved.step().await.unwrap();

        for (a, b) in whole.params().iter().zip(halved.params()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[tokio::test]
    async fn set_lr_scales_the_update() {
        let (x, y) = batch();

        let mut small = engine();
        let mut big = engine();
        big.set_lr(0.2);

        for engine in [&mut small, &mut big] {
            engine.zero_grad();
            let (out, tape) = engine.forward(x.view()).unwrap();
            engine.criterion(out.view(), y.view()).unwrap();
            engine.backward(tape).unwrap();
            engine.step().await.unwrap();
        }

        let before = seeded_params(
            &Sequential::new([
                Dense::new((2, 4), Some(ActFn::Relu)),
                Dense::new((4, 2), None),
            ])
            .unwrap(),
            Some(11),
        );

        for ((s, b), orig) in small.params().iter().zip(big.params()).zip(before) {
            let small_step = s - orig;
            let big_step = b - orig;
            assert!((big_step - 2.0 * small_step).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn state_roundtrip_restores_parameters() {
        let (x, y) = batch();

        let mut engine_a = engine();
        engine_a.zero_grad();
        let (out, tape) = engine_a.forward(x.view()).unwrap();
        engine_a.criterion(out.view(), y.view()).unwrap();
        engine_a.backward(tape).unwrap();
        engine_a.step().await.unwrap();

        let saved = engine_a.state();

        let mut engine_b = engine();
        engine_b.load_state(&saved).unwrap();

        assert_eq!(engine_a.params(), engine_b.params());
        assert_eq!(engine_b.state(), saved);
    }
}
