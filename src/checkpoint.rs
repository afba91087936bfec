//! Persisting and restoring training runs.
//!
//! A checkpoint is one safetensors file: a flat `params` tensor, one
//! `opt.<i>` tensor per optimizer state slot, and the epoch / step
//! counters in the metadata map. Tensors are stored as `f32`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use safetensors::SafeTensors;
use safetensors::tensor::{Dtype, TensorView};

use crate::engine::EngineState;
use crate::error::{Result, TrainError};

/// A resumable snapshot of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Finished training epochs at save time.
    pub epoch: usize,
    /// Optimizer steps taken at save time.
    pub global_step: usize,
    pub engine: EngineState,
}

/// Where checkpoints live; hooks only see this seam.
pub trait CheckpointStore: Send {
    /// # Errors
    /// Persistence failures are fatal, the caller does not retry.
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// # Errors
    /// A missing or unreadable checkpoint is fatal, the caller does not
    /// fall back to fresh state.
    fn load(&self) -> Result<Checkpoint>;
}

/// A checkpoint store over one safetensors file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fail(&self, detail: impl fmt::Display) -> TrainError {
        TrainError::Checkpoint {
            path: self.path.clone(),
            detail: detail.to_string(),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut views: Vec<(String, TensorView<'_>)> = Vec::with_capacity(
            1 + checkpoint.engine.opt_state.len(),
        );
        views.push((
            "params".to_string(),
            f32_view(&checkpoint.engine.params).map_err(|e| self.fail(e))?,
        ));
        for (i, slot) in checkpoint.engine.opt_state.iter().enumerate() {
            views.push((format!("opt.{i}"), f32_view(slot).map_err(|e| self.fail(e))?));
        }

        let metadata = HashMap::from([
            ("epoch".to_string(), checkpoint.epoch.to_string()),
            ("step".to_string(), checkpoint.global_step.to_string()),
        ]);

        let bytes = safetensors::serialize(views, &Some(metadata)).map_err(|e| self.fail(e))?;
        fs::write(&self.path, bytes).map_err(|e| self.fail(e))?;
        Ok(())
    }

    fn load(&self) -> Result<Checkpoint> {
        let bytes = fs::read(&self.path).map_err(|e| self.fail(e))?;

        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| self.fail(e))?;
        let info = header
            .metadata()
            .as_ref()
            .ok_or_else(|| self.fail("no metadata map"))?;
        let epoch = parse_counter(info, "epoch").map_err(|e| self.fail(e))?;
        let global_step = parse_counter(info, "step").map_err(|e| self.fail(e))?;

        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| self.fail(e))?;
        let params = f32_values(&tensors, "params").map_err(|e| self.fail(e))?;

        let slots = tensors
            .names()
            .iter()
            .filter(|name| name.starts_with("opt."))
            .count();
        let mut opt_state = Vec::with_capacity(slots);
        for i in 0..slots {
            opt_state.push(f32_values(&tensors, &format!("opt.{i}")).map_err(|e| self.fail(e))?);
        }

        Ok(Checkpoint {
            epoch,
            global_step,
            engine: EngineState { params, opt_state },
        })
    }
}

fn parse_counter(info: &HashMap<String, String>, key: &str) -> std::result::Result<usize, String> {
    info.get(key)
        .ok_or_else(|| format!("metadata lacks `{key}`"))?
        .parse()
        .map_err(|_| format!("metadata `{key}` is not a count"))
}

fn f32_view(values: &[f32]) -> std::result::Result<TensorView<'_>, String> {
    TensorView::new(Dtype::F32, vec![values.len()], bytemuck::cast_slice(values))
        .map_err(|e| e.to_string())
}

/// Copies a named `f32` tensor out of the file.
///
/// The file's data section gives no alignment promise, so the bytes are
/// copied into an owned buffer instead of cast in place.
fn f32_values(tensors: &SafeTensors<'_>, name: &str) -> std::result::Result<Vec<f32>, String> {
    let view = tensors
        .tensor(name)
        .map_err(|_| format!("tensor `{name}` is missing"))?;
    if view.dtype() != Dtype::F32 {
        return Err(format!("tensor `{name}` is not f32"));
    }

    let data = view.data();
    let mut values = vec![0.0f32; data.len() / size_of::<f32>()];
    bytemuck::cast_slice_mut::<f32, u8>(&mut values).copy_from_slice(data);
    Ok(values)
}
