use crate::engine::Engine;
use crate::error::Result;
use crate::hooks::{Hook, HookCtx};
use crate::lr::LrScheduler;

/// Drives a learning-rate scheduler and applies its rate to the engine.
///
/// With `by_epoch` off the scheduler advances exactly once per
/// `after_train_iter`; the trainer fires that point once per optimizer
/// step, so accumulation micro-steps never advance the schedule. With
/// `by_epoch` on it advances once per finished training epoch.
///
/// The current rate is also published as `train/lr`.
#[derive(Debug)]
pub struct LrSchedulerHook<S> {
    scheduler: S,
    by_epoch: bool,
}

impl<S: LrScheduler> LrSchedulerHook<S> {
    pub fn new(scheduler: S, by_epoch: bool) -> Self {
        Self {
            scheduler,
            by_epoch,
        }
    }

    fn advance<E: Engine>(&mut self, ctx: &mut HookCtx<'_, E>) {
        let lr = self.scheduler.advance();
        ctx.engine.set_lr(lr);
        ctx.metrics.set_value("train/lr", f64::from(lr));
    }
}

impl<S: LrScheduler, E: Engine> Hook<E> for LrSchedulerHook<S> {
    fn priority(&self) -> i32 {
        4
    }

    fn before_train(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let lr = self.scheduler.current_lr();
        ctx.engine.set_lr(lr);
        ctx.metrics.set_value("train/lr", f64::from(lr));
        Ok(())
    }

    fn after_train_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        if !self.by_epoch {
            self.advance(ctx);
        }
        Ok(())
    }

    fn after_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        if self.by_epoch {
            self.advance(ctx);
        }
        Ok(())
    }
}
