use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;

use crate::engine::Engine;
use crate::error::{Result, TrainError};
use crate::hooks::{Hook, HookCtx};

/// A sink for named scalars, one value per optimizer step mark.
pub trait ScalarWriter: Send {
    fn write_scalar(&mut self, step: usize, name: &str, value: f64) -> Result<()>;
}

#[derive(Serialize)]
struct ScalarRow<'a> {
    step: usize,
    name: &'a str,
    value: f64,
}

/// Appends scalars as JSON lines, one object per line.
pub struct JsonlScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlScalarWriter {
    /// Creates (or truncates) the file at `path`.
    ///
    /// # Errors
    /// Returns [`TrainError::Checkpoint`] when the file cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| TrainError::Checkpoint {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    fn fail(&self, detail: impl std::fmt::Display) -> TrainError {
        TrainError::Checkpoint {
            path: self.path.clone(),
            detail: detail.to_string(),
        }
    }
}

impl ScalarWriter for JsonlScalarWriter {
    fn write_scalar(&mut self, step: usize, name: &str, value: f64) -> Result<()> {
        let row = ScalarRow { step, name, value };
        serde_json::to_writer(&mut self.out, &row).map_err(|e| TrainError::Checkpoint {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        self.out.write_all(b"\n").map_err(|e| self.fail(e))?;
        self.out.flush().map_err(|e| self.fail(e))?;
        Ok(())
    }
}

/// Streams the metric registry to a [`ScalarWriter`] at each epoch end,
/// stamped with the current optimizer step.
pub struct MetricWriterHook<W> {
    writer: W,
}

impl<W: ScalarWriter> MetricWriterHook<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    fn write_phase<E>(&mut self, ctx: &mut HookCtx<'_, E>, prefix: &str) -> Result<()> {
        let step = ctx.state.global_step;
        for (name, value) in ctx.metrics.iter() {
            if name.starts_with(prefix) {
                self.writer.write_scalar(step, name, value)?;
            }
        }
        Ok(())
    }
}

impl<W: ScalarWriter, E: Engine> Hook<E> for MetricWriterHook<W> {
    fn after_train_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        self.write_phase(ctx, "train/")
    }

    fn after_test_epoch(&mut self, ctx: &mut HookCtx<'_, E>) -> Result<()> {
        self.write_phase(ctx, "test/")
    }
}
