use crate::error::{ModelError, Result};

/// An update rule over flat parameter and gradient buffers.
///
/// `state` and `load_state` expose the rule's internal buffers in a stable
/// order so a checkpoint can restore training exactly where it stopped.
pub trait Optimizer: Send {
    /// Updates the parameters according to the algorithm's learning rule.
    ///
    /// # Arguments
    /// * `params` - The parameters that are going to be modified.
    /// * `grad` - The gradient used for taking the step.
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);

    fn state(&self) -> Vec<Vec<f32>>;

    fn load_state(&mut self, state: &[Vec<f32>]) -> Result<()>;
}

fn check_len(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(ModelError::SizeMismatch {
            what,
            got,
            expected,
        });
    }
    Ok(())
}

/// Gradient descent with optional momentum.
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance updates.
    /// * `learning_rate` - The *length* of the steps taken on `update_params`.
    /// * `momentum` - The velocity decay factor, `0.0` for plain descent.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for Sgd {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_len("sgd params", params.len(), self.velocity.len())?;
        check_len("sgd grad", grad.len(), self.velocity.len())?;

        let Self {
            learning_rate: lr,
            momentum,
            ..
        } = *self;

        if momentum == 0.0 {
            for (p, g) in params.iter_mut().zip(grad) {
                *p -= lr * g;
            }
            return Ok(());
        }

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = momentum * *v + g;
                *p -= lr * *v;
            });

        Ok(())
    }

    fn lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn state(&self) -> Vec<Vec<f32>> {
        vec![self.velocity.to_vec()]
    }

    fn load_state(&mut self, state: &[Vec<f32>]) -> Result<()> {
        check_len("sgd state", state.len(), 1)?;
        check_len("sgd velocity", state[0].len(), self.velocity.len())?;

        self.velocity.copy_from_slice(&state[0]);
        Ok(())
    }
}

/// The Adam optimizer with bias-corrected moment estimates.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_len("adam params", params.len(), self.v.len())?;
        check_len("adam grad", grad.len(), self.v.len())?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }

    fn lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn state(&self) -> Vec<Vec<f32>> {
        vec![
            self.v.to_vec(),
            self.s.to_vec(),
            vec![self.beta1_t, self.beta2_t],
        ]
    }

    fn load_state(&mut self, state: &[Vec<f32>]) -> Result<()> {
        check_len("adam state", state.len(), 3)?;
        check_len("adam v", state[0].len(), self.v.len())?;
        check_len("adam s", state[1].len(), self.s.len())?;
        check_len("adam betas", state[2].len(), 2)?;

        self.v.copy_from_slice(&state[0]);
        self.s.copy_from_slice(&state[1]);
        self.beta1_t = state[2][0];
        self.beta2_t = state[2][1];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgd_steps_against_the_gradient() {
        let mut sgd = Sgd::new(2, 0.5, 0.0);
        let mut params = [1.0, -1.0];

        sgd.update_params(&mut params, &[2.0, -2.0]).unwrap();
        assert_eq!(params, [0.0, 0.0]);
    }

    #[test]
    fn momentum_accelerates_repeated_gradients() {
        let mut plain = Sgd::new(1, 0.1, 0.0);
        let mut heavy = Sgd::new(1, 0.1, 0.9);
        let mut p_plain = [1.0];
        let mut p_heavy = [1.0];

        for _ in 0..3 {
            plain.update_params(&mut p_plain, &[1.0]).unwrap();
            heavy.update_params(&mut p_heavy, &[1.0]).unwrap();
        }

        assert!(p_heavy[0] < p_plain[0]);
    }

    #[test]
    fn adam_first_step_is_about_the_learning_rate() {
        let mut adam = Adam::new(1, 0.01, 0.9, 0.999, 1e-8);
        let mut params = [0.0];

        adam.update_params(&mut params, &[3.5]).unwrap();

        // With bias correction the very first step has magnitude ~lr.
        assert!((params[0] + 0.01).abs() < 1e-4, "got {}", params[0]);
    }

    #[test]
    fn adam_state_roundtrip_resumes_identically() {
        let mut warm = Adam::new(2, 0.01, 0.9, 0.999, 1e-8);
        let mut params = [0.5, -0.5];
        for _ in 0..3 {
            warm.update_params(&mut params, &[0.3, -0.1]).unwrap();
        }

        let mut resumed = Adam::new(2, 0.01, 0.9, 0.999, 1e-8);
        resumed.load_state(&warm.state()).unwrap();
        let mut resumed_params = params;

        warm.update_params(&mut params, &[0.2, 0.4]).unwrap();
        resumed.update_params(&mut resumed_params, &[0.2, 0.4]).unwrap();

        assert_eq!(params, resumed_params);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut adam = Adam::new(2, 0.01, 0.9, 0.999, 1e-8);
        let mut params = [0.0];
        let err = adam.update_params(&mut params, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ModelError::SizeMismatch { .. }));
    }
}
