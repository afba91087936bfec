//! A training orchestration core: epochs, schedules, hooks.
//!
//! The layering is strict. [`Trainer::fit`] only sequences epochs, logical
//! steps and hook firing; a [`Schedule`] decides how one batch flows
//! through an [`Engine`] (whole-batch, or cut into micro-batches pumped
//! through a stage pipeline); the engine owns parameters, gradient
//! accumulation and the optimizer. Everything observable about a run,
//! metrics, learning-rate control, checkpoints, log lines, lives in
//! [`hooks`].
//!
//! Stage-to-stage traffic and the rank topology come from the `baton`
//! crate; the dense model kit, losses and optimizers come from `ensemble`.

pub mod checkpoint;
pub mod data;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod lr;
pub mod memory;
pub mod metrics;
pub mod schedule;
pub mod timer;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
pub use data::{Batch, DataLoader, TensorDataset, TensorLoader};
pub use engine::{Engine, EngineState, ModuleEngine};
pub use error::{Result, TrainError};
pub use hooks::{Hook, HookCtx};
pub use lr::{LinearWarmupLr, LrScheduler, StepDecayLr};
pub use memory::{MemoryProbe, MemoryReading};
pub use metrics::Metrics;
pub use schedule::{BatchSchedule, PipelineSchedule, Schedule, StepResult};
pub use timer::{Stopwatch, TimerSet};
pub use trainer::{FitOptions, FitReport, StopReason, Trainer, TrainerState};
