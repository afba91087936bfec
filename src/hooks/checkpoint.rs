use log::info;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::engine::Engine;
use crate::error::Result;
use crate::hooks::{Hook, HookCtx};

/// Saves the engine every `interval` finished epochs.
///
/// Save failures abort the fit.
#[derive(Debug)]
pub struct SaveCheckpointHook<C> {
    store: C,
    interval: usize,
}

impl<C: CheckpointStore> SaveCheckpointHook<C> {
    /// # Arguments
    /// * `interval` - Save every this many epochs; `0` never saves.
    pub fn new(store: C, interval: usize) -> Self {
        Self { store, interval }
    }
}

impl<C: CheckpointStore, E: Engine> Hook<E> for SaveCheckpointHook<C> {
    fn after_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        if self.interval == 0 || ctx.state.epoch % self.interval != 0 {
            return Ok(());
        }

        let checkpoint = Checkpoint {
            epoch: ctx.state.epoch,
            global_step: ctx.state.global_step,
            engine: ctx.engine.state(),
        };
        self.store.save(&checkpoint)?;
        info!(
            epoch = ctx.state.epoch,
            step = ctx.state.global_step;
            "checkpoint saved"
        );
        Ok(())
    }
}

/// Restores engine state and counters before training starts.
///
/// A missing or unreadable checkpoint aborts the fit; starting fresh
/// instead is the caller's call to make, by not attaching this hook.
#[derive(Debug)]
pub struct LoadCheckpointHook<C> {
    store: C,
}

impl<C: CheckpointStore> LoadCheckpointHook<C> {
    pub fn new(store: C) -> Self {
        Self { store }
    }
}

impl<C: CheckpointStore, E: Engine> Hook<E> for LoadCheckpointHook<C> {
    fn before_train(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let checkpoint = self.store.load()?;
        ctx.engine.load_state(&checkpoint.engine)?;
        ctx.state.epoch = checkpoint.epoch;
        ctx.state.global_step = checkpoint.global_step;
        info!(
            epoch = checkpoint.epoch,
            step = checkpoint.global_step;
            "checkpoint restored"
        );
        Ok(())
    }
}
