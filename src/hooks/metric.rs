//! Hooks that fold step results into the metric registry.

use ndarray::{Array2, ArrayView1};

use crate::engine::Engine;
use crate::error::Result;
use crate::hooks::{Hook, HookCtx};
use crate::trainer::{TEST_STEP_TIMER, TRAIN_STEP_TIMER};

fn phase(evaluating: bool) -> &'static str {
    if evaluating { "test" } else { "train" }
}

/// Tracks the running mean loss per phase (`train/loss`, `test/loss`).
///
/// Runs at priority 0 so later hooks read a current value.
#[derive(Debug, Default)]
pub struct LossHook;

impl LossHook {
    pub fn new() -> Self {
        Self
    }

    fn record<E>(ctx: &mut HookCtx<'_, E>) {
        let Some(loss) = ctx.state.record.as_ref().and_then(|r| r.loss) else {
            return;
        };
        let name = format!("{}/loss", phase(ctx.state.evaluating));
        ctx.metrics.add_mean(&name, f64::from(loss));
    }
}

impl<E: Engine> Hook<E> for LossHook {
    fn priority(&self) -> i32 {
        0
    }

    fn before_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        ctx.metrics.reset("train/loss");
        Ok(())
    }

    fn after_train_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Self::record(ctx);
        Ok(())
    }

    fn before_test_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        ctx.metrics.reset("test/loss");
        Ok(())
    }

    fn after_test_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Self::record(ctx);
        Ok(())
    }
}

fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &v) in row.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

fn argmax_hits(output: &Array2<f32>, label: &Array2<f32>) -> (u64, u64) {
    let mut hits = 0;
    for (out, lab) in output.rows().into_iter().zip(label.rows()) {
        if argmax(out) == argmax(lab) {
            hits += 1;
        }
    }
    (hits, output.nrows() as u64)
}

/// Accumulates argmax accuracy per epoch on whichever stage owns outputs.
///
/// Labels are expected one-hot (or at least argmax-comparable). Stages
/// without outputs record nothing.
#[derive(Debug, Default)]
pub struct AccuracyHook;

impl AccuracyHook {
    pub fn new() -> Self {
        Self
    }

    fn record<E>(ctx: &mut HookCtx<'_, E>) {
        let Some(record) = ctx.state.record.as_ref() else {
            return;
        };
        let (Some(output), Some(label)) = (record.output.as_ref(), record.label.as_ref()) else {
            return;
        };
        let (hits, total) = argmax_hits(output, label);
        let name = format!("{}/accuracy", phase(ctx.state.evaluating));
        ctx.metrics.add_ratio(&name, hits, total);
    }
}

impl<E: Engine> Hook<E> for AccuracyHook {
    fn priority(&self) -> i32 {
        2
    }

    fn before_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        ctx.metrics.reset("train/accuracy");
        Ok(())
    }

    fn after_train_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Self::record(ctx);
        Ok(())
    }

    fn before_test_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        ctx.metrics.reset("test/accuracy");
        Ok(())
    }

    fn after_test_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Self::record(ctx);
        Ok(())
    }
}

/// Reports samples per second over each epoch from the step timers.
#[derive(Debug, Default)]
pub struct ThroughputHook {
    train_samples: usize,
    train_mark: f64,
    test_samples: usize,
    test_mark: f64,
}

impl ThroughputHook {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_samples<E>(samples: &mut usize, ctx: &HookCtx<'_, E>) {
        if let Some(record) = ctx.state.record.as_ref() {
            *samples += record.samples;
        }
    }
}

impl<E: Engine> Hook<E> for ThroughputHook {
    fn priority(&self) -> i32 {
        2
    }

    fn before_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        self.train_samples = 0;
        self.train_mark = ctx.timers.elapsed(TRAIN_STEP_TIMER).as_secs_f64();
        Ok(())
    }

    fn after_train_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Self::record_samples(&mut self.train_samples, ctx);
        Ok(())
    }

    fn after_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let spent = ctx.timers.elapsed(TRAIN_STEP_TIMER).as_secs_f64() - self.train_mark;
        if spent > 0.0 {
            ctx.metrics
                .set_value("train/throughput", self.train_samples as f64 / spent);
        }
        Ok(())
    }

    fn before_test_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        self.test_samples = 0;
        self.test_mark = ctx.timers.elapsed(TEST_STEP_TIMER).as_secs_f64();
        Ok(())
    }

    fn after_test_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Self::record_samples(&mut self.test_samples, ctx);
        Ok(())
    }

    fn after_test_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let spent = ctx.timers.elapsed(TEST_STEP_TIMER).as_secs_f64() - self.test_mark;
        if spent > 0.0 {
            ctx.metrics
                .set_value("test/throughput", self.test_samples as f64 / spent);
        }
        Ok(())
    }
}
