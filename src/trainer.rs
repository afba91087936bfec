//! The fit loop: epochs, logical steps, hook firing and evaluation.

use std::num::NonZeroUsize;

use log::info;
use ndarray::{Array2, Axis, concatenate};
use serde::{Deserialize, Serialize};

use crate::data::DataLoader;
use crate::engine::Engine;
use crate::error::{Result, TrainError};
use crate::hooks::{Hook, HookCtx};
use crate::metrics::Metrics;
use crate::schedule::{Schedule, StepResult};
use crate::timer::TimerSet;

pub const TRAIN_STEP_TIMER: &str = "train-step";
pub const TRAIN_EPOCH_TIMER: &str = "train-epoch";
pub const TEST_STEP_TIMER: &str = "test-step";
pub const TEST_EPOCH_TIMER: &str = "test-epoch";

/// Counters and the last step result, readable by every hook.
///
/// `epoch` holds the number of finished training epochs; while an epoch
/// runs it doubles as that epoch's zero-based index and is bumped just
/// before `after_train_epoch` fires. `global_step` counts optimizer steps,
/// one per logical step regardless of gradient accumulation.
#[derive(Debug, Default)]
pub struct TrainerState {
    pub epoch: usize,
    pub max_epochs: usize,
    pub step_in_epoch: usize,
    pub global_step: usize,
    pub max_steps: Option<usize>,
    pub record: Option<StepResult>,
    pub evaluating: bool,
    pub stop_requested: bool,
}

/// Knobs for one `fit` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    /// Training epochs to run.
    pub epochs: usize,
    /// Evaluate every this many epochs; `0` never evaluates.
    #[serde(default = "default_test_interval")]
    pub test_interval: usize,
    /// Hard cap on optimizer steps across the whole fit.
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Batches consumed per optimizer step.
    #[serde(default = "default_grad_accum")]
    pub grad_accum: NonZeroUsize,
    /// Log a progress line per step and per epoch.
    #[serde(default)]
    pub display_progress: bool,
}

fn default_test_interval() -> usize {
    1
}

fn default_grad_accum() -> NonZeroUsize {
    NonZeroUsize::MIN
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            test_interval: default_test_interval(),
            max_steps: None,
            grad_accum: default_grad_accum(),
            display_progress: false,
        }
    }
}

/// Why `fit` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every requested epoch ran.
    EpochsDone,
    /// The optimizer step cap was reached.
    MaxSteps,
    /// A hook called `request_stop`.
    Requested,
}

/// What a finished `fit` call reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitReport {
    /// Epochs entered by this call; a stop may cut the last one short.
    pub epochs_run: usize,
    /// Optimizer steps taken by this call.
    pub steps_run: usize,
    pub stop: StopReason,
}

/// Drives an engine through epochs of batches and fires hooks in between.
///
/// The trainer only sequences: schedules run the passes, the engine owns
/// parameters and optimizer, hooks compute metrics, checkpoints and all
/// other side work.
pub struct Trainer<E> {
    engine: E,
    timers: TimerSet,
    metrics: Metrics,
    state: TrainerState,
}

impl<E: Engine> Trainer<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            timers: TimerSet::new(),
            metrics: Metrics::new(),
            state: TrainerState::default(),
        }
    }

    #[inline]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[inline]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    #[inline]
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    #[inline]
    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    #[inline]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Hands the engine back, e.g. to read final parameters.
    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Runs the training loop.
    ///
    /// Hooks fire in ascending priority; ties keep their registration
    /// order. One logical step consumes `grad_accum` batches through the
    /// schedule and ends in exactly one `engine.step()`. A trailing group
    /// shorter than `grad_accum` still steps; the engine averages over the
    /// backwards it actually saw.
    ///
    /// Reaching `max_steps` or a hook stop request finishes the running
    /// step and its hooks, fires `after_train_epoch` once, skips
    /// evaluation and leaves the loop.
    ///
    /// When several ranks fit together, every rank must see the same
    /// number of batches per epoch; the trainer does not detect skew.
    ///
    /// # Errors
    /// The first error from a hook, the schedule or the engine aborts the
    /// fit and propagates.
    pub async fn fit<S: Schedule<E>>(
        &mut self,
        train_loader: &mut dyn DataLoader,
        mut test_loader: Option<&mut dyn DataLoader>,
        schedule: &mut S,
        mut hooks: Vec<Box<dyn Hook<E>>>,
        opts: FitOptions,
    ) -> Result<FitReport> {
        let FitOptions {
            epochs,
            test_interval,
            max_steps,
            grad_accum,
            display_progress,
        } = opts;

        self.state.max_epochs = epochs;
        self.state.max_steps = max_steps;
        self.state.stop_requested = false;

        hooks.sort_by_key(|hook| hook.priority());
        self.fire(&mut hooks, |hook, ctx| hook.before_train(ctx))?;

        // A load hook may have moved the counters forward.
        let first_epoch = self.state.epoch;
        let first_step = self.state.global_step;
        let mut stop = StopReason::EpochsDone;

        'epochs: for epoch in first_epoch..epochs {
            self.state.epoch = epoch;
            self.state.step_in_epoch = 0;
            train_loader.reset();

            self.timers.start(TRAIN_EPOCH_TIMER);
            self.fire(&mut hooks, |hook, ctx| hook.before_train_epoch(ctx))?;

            let batches = train_loader.len();
            let mut consumed = 0;
            while consumed < batches {
                if self.should_stop() {
                    break;
                }

                self.fire(&mut hooks, |hook, ctx| hook.before_train_iter(ctx))?;
                self.timers.start(TRAIN_STEP_TIMER);
                self.engine.zero_grad();

                let group = grad_accum.get().min(batches - consumed);
                let mut results = Vec::with_capacity(group);
                for _ in 0..group {
                    let batch = train_loader
                        .next_batch()
                        .ok_or(TrainError::State("loader ended before its reported length"))?;
                    results.push(
                        schedule
                            .forward_backward_step(&mut self.engine, batch, false)
                            .await?,
                    );
                    consumed += 1;
                }
                self.engine.step().await?;

                self.timers.stop(TRAIN_STEP_TIMER);
                self.state.global_step += 1;
                self.state.step_in_epoch += 1;
                self.state.record = Some(merge_results(results)?);
                self.fire(&mut hooks, |hook, ctx| hook.after_train_iter(ctx))?;

                if display_progress {
                    let loss = self.state.record.as_ref().and_then(|r| r.loss);
                    match loss {
                        Some(loss) => info!(
                            epoch = epoch,
                            step = self.state.global_step;
                            "train step done: loss={loss:.4}"
                        ),
                        None => info!(
                            epoch = epoch,
                            step = self.state.global_step;
                            "train step done"
                        ),
                    }
                }
            }

            self.state.epoch = epoch + 1;
            self.timers.stop(TRAIN_EPOCH_TIMER);
            self.fire(&mut hooks, |hook, ctx| hook.after_train_epoch(ctx))?;

            if display_progress {
                info!(
                    epoch = epoch,
                    steps = self.state.step_in_epoch;
                    "train epoch done"
                );
            }

            if self.should_stop() {
                stop = if self.state.stop_requested {
                    StopReason::Requested
                } else {
                    StopReason::MaxSteps
                };
                break 'epochs;
            }

            if let Some(loader) = test_loader.as_deref_mut()
                && test_interval > 0
                && (epoch + 1) % test_interval == 0
            {
                self.evaluate(loader, schedule, &mut hooks).await?;
            }
        }

        self.fire(&mut hooks, |hook, ctx| hook.after_train(ctx))?;

        Ok(FitReport {
            epochs_run: self.state.epoch - first_epoch,
            steps_run: self.state.global_step - first_step,
            stop,
        })
    }

    /// One full pass over `loader` with gradients off.
    async fn evaluate<S: Schedule<E>>(
        &mut self,
        loader: &mut dyn DataLoader,
        schedule: &mut S,
        hooks: &mut [Box<dyn Hook<E>>],
    ) -> Result<()> {
        self.state.evaluating = true;
        self.fire(hooks, |hook, ctx| hook.before_test(ctx))?;

        loader.reset();
        self.timers.start(TEST_EPOCH_TIMER);
        self.fire(hooks, |hook, ctx| hook.before_test_epoch(ctx))?;

        let batches = loader.len();
        let mut consumed = 0;
        while consumed < batches {
            self.fire(hooks, |hook, ctx| hook.before_test_iter(ctx))?;
            self.timers.start(TEST_STEP_TIMER);

            let batch = loader
                .next_batch()
                .ok_or(TrainError::State("loader ended before its reported length"))?;
            let result = schedule
                .forward_backward_step(&mut self.engine, batch, true)
                .await?;
            consumed += 1;

            self.timers.stop(TEST_STEP_TIMER);
            self.state.record = Some(result);
            self.fire(hooks, |hook, ctx| hook.after_test_iter(ctx))?;
        }

        self.timers.stop(TEST_EPOCH_TIMER);
        self.fire(hooks, |hook, ctx| hook.after_test_epoch(ctx))?;
        self.fire(hooks, |hook, ctx| hook.after_test(ctx))?;
        self.state.evaluating = false;

        Ok(())
    }

    /// Fires one extension point on every hook, in sorted order.
    fn fire(
        &mut self,
        hooks: &mut [Box<dyn Hook<E>>],
        point: impl Fn(&mut dyn Hook<E>, &mut HookCtx<'_, E>) -> Result<()>,
    ) -> Result<()> {
        let mut ctx = HookCtx {
            state: &mut self.state,
            engine: &mut self.engine,
            timers: &mut self.timers,
            metrics: &mut self.metrics,
        };
        for hook in hooks.iter_mut() {
            point(hook.as_mut(), &mut ctx)?;
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.state.stop_requested
            || self
                .state
                .max_steps
                .is_some_and(|cap| self.state.global_step >= cap)
    }
}

/// Folds the results of one accumulation group into a single record.
///
/// Outputs and labels are stacked back in batch order when every group
/// member carried them; the loss is the plain mean over the group.
fn merge_results(mut results: Vec<StepResult>) -> Result<StepResult> {
    if results.len() <= 1 {
        return results
            .pop()
            .ok_or(TrainError::State("a step produced no result"));
    }

    let samples = results.iter().map(|r| r.samples).sum();

    let losses: Vec<f32> = results.iter().filter_map(|r| r.loss).collect();
    let loss = (losses.len() == results.len())
        .then(|| losses.iter().sum::<f32>() / losses.len() as f32);

    let output = stack_group(results.iter().map(|r| r.output.as_ref()))?;
    let label = stack_group(results.iter().map(|r| r.label.as_ref()))?;

    Ok(StepResult {
        output,
        label,
        loss,
        samples,
    })
}

fn stack_group<'a>(
    arrays: impl Iterator<Item = Option<&'a Array2<f32>>> + ExactSizeIterator,
) -> Result<Option<Array2<f32>>> {
    let total = arrays.len();
    let views: Vec<_> = arrays.flatten().map(|a| a.view()).collect();
    if views.len() != total {
        return Ok(None);
    }

    concatenate(Axis(0), &views)
        .map(Some)
        .map_err(|_| TrainError::State("group results disagree on width"))
}
