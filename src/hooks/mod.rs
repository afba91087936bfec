//! Extension points around the fit loop.
//!
//! The trainer itself only sequences; everything observable about a run,
//! metrics, learning-rate control, checkpoints, log lines, happens in
//! hooks. Hooks fire in ascending priority, ties keep their registration
//! order, and any hook error aborts the fit.

mod checkpoint;
mod log;
mod lr;
mod metric;
mod writer;

pub use checkpoint::{LoadCheckpointHook, SaveCheckpointHook};
pub use lr::LrSchedulerHook;
pub use metric::{AccuracyHook, LossHook, ThroughputHook};
pub use self::log::{
    LogMemoryByEpochHook, LogMetricByEpochHook, LogMetricByStepHook, LogTimingByEpochHook,
};
pub use writer::{JsonlScalarWriter, MetricWriterHook, ScalarWriter};

use crate::engine::Engine;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::timer::TimerSet;
use crate::trainer::TrainerState;

/// What a hook sees when it fires.
pub struct HookCtx<'a, E> {
    pub state: &'a mut TrainerState,
    pub engine: &'a mut E,
    pub timers: &'a mut TimerSet,
    pub metrics: &'a mut Metrics,
}

impl<E> HookCtx<'_, E> {
    /// Asks the trainer to stop after the current step's hooks ran.
    pub fn request_stop(&mut self) {
        self.state.stop_requested = true;
    }
}

/// A fit loop observer; every extension point defaults to a no-op.
///
/// `priority` orders hooks at each point, lower values fire first. The
/// built-in metric hooks run at 0-2 so that logging hooks at the default
/// 10 see fresh values.
pub trait Hook<E: Engine>: Send {
    fn priority(&self) -> i32 {
        10
    }

    fn before_train(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn after_train(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn before_train_epoch(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn after_train_epoch(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn before_train_iter(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn after_train_iter(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn before_test(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn after_test(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn before_test_epoch(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn after_test_epoch(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn before_test_iter(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }

    fn after_test_iter(&mut self, _ctx: &mut HookCtx<'_, E>) -> Result<()> {
        Ok(())
    }
}
