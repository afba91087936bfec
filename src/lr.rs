/// A learning rate schedule advanced explicitly by the scheduler hook.
///
/// `advance` moves one tick (an optimizer step or an epoch, depending on
/// how the owning hook is configured) and returns the new rate.
pub trait LrScheduler: Send {
    fn advance(&mut self) -> f32;

    fn current_lr(&self) -> f32;
}

/// Linear ramp from zero to the base rate, then linear decay to zero.
#[derive(Debug, Clone)]
pub struct LinearWarmupLr {
    base_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl LinearWarmupLr {
    pub fn new(base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }

    fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f32 / (self.warmup_steps + 1) as f32;
        }

        if step >= self.total_steps {
            return 0.0;
        }

        let left = (self.total_steps - step) as f32;
        let span = (self.total_steps - self.warmup_steps) as f32;
        self.base_lr * left / span
    }
}

impl LrScheduler for LinearWarmupLr {
    fn advance(&mut self) -> f32 {
        self.step += 1;
        self.current_lr()
    }

    fn current_lr(&self) -> f32 {
        self.lr_at(self.step)
    }
}

/// Multiplies the rate by `gamma` every `step_size` ticks.
#[derive(Debug, Clone)]
pub struct StepDecayLr {
    base_lr: f32,
    step_size: usize,
    gamma: f32,
    step: usize,
}

impl StepDecayLr {
    pub fn new(base_lr: f32, step_size: usize, gamma: f32) -> Self {
        assert!(step_size > 0, "step_size must be positive");

        Self {
            base_lr,
            step_size,
            gamma,
            step: 0,
        }
    }
}

impl LrScheduler for StepDecayLr {
    fn advance(&mut self) -> f32 {
        self.step += 1;
        self.current_lr()
    }

    fn current_lr(&self) -> f32 {
        let drops = (self.step / self.step_size) as i32;
        self.base_lr * self.gamma.powi(drops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_ramps_then_decays_to_zero() {
        let mut lr = LinearWarmupLr::new(1.0, 2, 6);

        // Ticks 1 and 2 are still warming up, tick 3 onwards decays.
        assert!((lr.current_lr() - 1.0 / 3.0).abs() < 1e-6);
        assert!((lr.advance() - 2.0 / 3.0).abs() < 1e-6);
        assert!((lr.advance() - 1.0).abs() < 1e-6);
        assert!((lr.advance() - 0.75).abs() < 1e-6);

        for _ in 0..3 {
            lr.advance();
        }
        assert_eq!(lr.current_lr(), 0.0);
    }

    #[test]
    fn warmup_rate_is_monotonic_until_peak() {
        let mut lr = LinearWarmupLr::new(0.1, 5, 20);
        let mut last = lr.current_lr();

        for _ in 0..4 {
            let next = lr.advance();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn step_decay_drops_by_gamma() {
        let mut lr = StepDecayLr::new(1.0, 2, 0.1);

        assert_eq!(lr.current_lr(), 1.0);
        assert_eq!(lr.advance(), 1.0);
        assert!((lr.advance() - 0.1).abs() < 1e-7);
        assert!((lr.advance() - 0.1).abs() < 1e-7);
        assert!((lr.advance() - 0.01).abs() < 1e-8);
    }
}
