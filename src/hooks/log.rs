//! Hooks that report progress through the `log` facade.

use log::info;

use crate::engine::Engine;
use crate::error::Result;
use crate::hooks::{Hook, HookCtx};
use crate::memory::MemoryProbe;
use crate::metrics::Metrics;

fn format_metrics(metrics: &Metrics, prefix: &str) -> String {
    let parts: Vec<String> = metrics
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(name, value)| format!("{name}={value:.6}"))
        .collect();
    parts.join(" ")
}

/// Logs the resolved metric registry once per epoch.
#[derive(Debug, Default)]
pub struct LogMetricByEpochHook;

impl LogMetricByEpochHook {
    pub fn new() -> Self {
        Self
    }
}

impl<E: Engine> Hook<E> for LogMetricByEpochHook {
    fn after_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let line = format_metrics(ctx.metrics, "train/");
        if !line.is_empty() {
            info!(epoch = ctx.state.epoch; "{line}");
        }
        Ok(())
    }

    fn after_test_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let line = format_metrics(ctx.metrics, "test/");
        if !line.is_empty() {
            info!(epoch = ctx.state.epoch; "{line}");
        }
        Ok(())
    }
}

/// Logs the resolved metric registry once per step.
#[derive(Debug, Default)]
pub struct LogMetricByStepHook;

impl LogMetricByStepHook {
    pub fn new() -> Self {
        Self
    }
}

impl<E: Engine> Hook<E> for LogMetricByStepHook {
    fn after_train_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let line = format_metrics(ctx.metrics, "train/");
        if !line.is_empty() {
            info!(step = ctx.state.global_step; "{line}");
        }
        Ok(())
    }

    fn after_test_iter(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let line = format_metrics(ctx.metrics, "test/");
        if !line.is_empty() {
            info!(step = ctx.state.global_step; "{line}");
        }
        Ok(())
    }
}

/// Logs cumulative and mean timer readings at each epoch end.
#[derive(Debug, Default)]
pub struct LogTimingByEpochHook {
    reset: bool,
}

impl LogTimingByEpochHook {
    /// # Arguments
    /// * `reset` - Clear every timer after logging it, so the next epoch
    ///   reads fresh.
    pub fn new(reset: bool) -> Self {
        Self { reset }
    }
}

impl<E: Engine> Hook<E> for LogTimingByEpochHook {
    fn after_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        let parts: Vec<String> = ctx
            .timers
            .iter()
            .filter(|(_, watch)| watch.laps() > 0)
            .map(|(name, watch)| {
                format!(
                    "{name}: total={:.3}s mean={:.1}ms laps={}",
                    watch.elapsed().as_secs_f64(),
                    watch.mean().as_secs_f64() * 1e3,
                    watch.laps()
                )
            })
            .collect();
        if !parts.is_empty() {
            info!(epoch = ctx.state.epoch; "timing | {}", parts.join(" | "));
        }

        if self.reset {
            let names: Vec<String> = ctx.timers.iter().map(|(name, _)| name.to_string()).collect();
            for name in names {
                ctx.timers.reset(&name);
            }
        }
        Ok(())
    }
}

/// Logs resident and peak memory at each epoch end.
///
/// Stays silent on platforms where the probe reads nothing.
#[derive(Debug, Default)]
pub struct LogMemoryByEpochHook {
    probe: MemoryProbe,
}

impl LogMemoryByEpochHook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: Engine> Hook<E> for LogMemoryByEpochHook {
    fn after_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        if let Some(reading) = self.probe.sample() {
            info!(
                epoch = ctx.state.epoch,
                resident_kib = reading.resident_kib,
                peak_kib = reading.peak_kib;
                "memory"
            );
        }
        Ok(())
    }
}
