use crate::data::Batch;
use crate::engine::Engine;
use crate::error::Result;
use crate::schedule::{Schedule, StepResult};

/// The plain schedule: one forward, one criterion, one backward.
///
/// Works on any engine that holds the whole model. The trainer may call it
/// several times between optimizer steps to accumulate gradients over
/// micro-batches.
#[derive(Debug, Default)]
pub struct BatchSchedule;

impl BatchSchedule {
    pub fn new() -> Self {
        Self
    }
}

impl<E: Engine> Schedule<E> for BatchSchedule {
    async fn forward_backward_step(
        &mut self,
        engine: &mut E,
        batch: Batch<'_>,
        forward_only: bool,
    ) -> Result<StepResult> {
        let samples = batch.len();
        let (output, tape) = engine.forward(batch.input)?;
        let loss = engine.criterion(output.view(), batch.label)?;
        if !forward_only {
            engine.backward(tape)?;
        }
        Ok(StepResult {
            output: Some(output),
            label: Some(batch.label.to_owned()),
            loss: Some(loss),
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use baton::SoloCollective;
    use ndarray::array;

    use super::*;
    use crate::engine::{Engine, ModuleEngine};
    use ensemble::{ActFn, Dense, Mse, Sequential, Sgd, seeded_params};

    fn tiny_engine() -> ModuleEngine<Sgd, SoloCollective, Mse> {
        let model = Sequential::new(vec![
            Dense::new((2, 3), Some(ActFn::Relu)),
            Dense::new((3, 1), None),
        ])
        .unwrap();
        let params = seeded_params(&model, Some(7));
        let opt = Sgd::new(model.size(), 0.1, 0.0);
        ModuleEngine::new(model, params, Mse, opt, SoloCollective).unwrap()
    }

    #[tokio::test]
    async fn one_step_reports_loss_and_samples() {
        let mut engine = tiny_engine();
        let mut schedule = BatchSchedule::new();
        let input = array![[0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let label = array![[1.0], [1.0], [0.0]];

        engine.zero_grad();
        let result = schedule
            .forward_backward_step(
                &mut engine,
                Batch { input: input.view(), label: label.view() },
                false,
            )
            .await
            .unwrap();

        assert_eq!(result.samples, 3);
        assert!(result.loss.unwrap() > 0.0);
        assert_eq!(result.output.unwrap().dim(), (3, 1));
        engine.step().await.unwrap();
    }

    #[tokio::test]
    async fn forward_only_leaves_gradients_empty() {
        let mut engine = tiny_engine();
        let mut schedule = BatchSchedule::new();
        let input = array![[0.5, 0.5]];
        let label = array![[1.0]];

        engine.zero_grad();
        schedule
            .forward_backward_step(
                &mut engine,
                Batch { input: input.view(), label: label.view() },
                true,
            )
            .await
            .unwrap();

        // No backward ran, so an optimizer step has nothing to apply.
        assert!(engine.step().await.is_err());
    }
}
