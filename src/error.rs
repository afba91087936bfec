use std::{error::Error, fmt, io, path::PathBuf};

use ensemble::ModelError;

/// The training core's result type.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Training runtime failures.
///
/// Communication and checkpoint errors are fatal: the run surfaces them
/// instead of retrying, restarts are a relaunch concern.
#[derive(Debug)]
pub enum TrainError {
    Config(String),
    Comm(io::Error),
    Model(ModelError),
    UnexpectedFrame {
        expected: &'static str,
        got: String,
    },
    TagMismatch {
        expected: u32,
        got: u32,
    },
    State(&'static str),
    Checkpoint {
        path: PathBuf,
        detail: String,
    },
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Config(msg) => write!(f, "bad configuration: {msg}"),
            TrainError::Comm(e) => write!(f, "communication error: {e}"),
            TrainError::Model(e) => write!(f, "model error: {e}"),
            TrainError::UnexpectedFrame { expected, got } => {
                write!(f, "expected a {expected} frame, got {got}")
            }
            TrainError::TagMismatch { expected, got } => write!(
                f,
                "expected the frame for micro-batch {expected}, got {got}"
            ),
            TrainError::State(what) => write!(f, "invalid call sequence: {what}"),
            TrainError::Checkpoint { path, detail } => {
                write!(f, "storage failure at {}: {detail}", path.display())
            }
        }
    }
}

impl Error for TrainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainError::Comm(e) => Some(e),
            TrainError::Model(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainError {
    fn from(value: io::Error) -> Self {
        Self::Comm(value)
    }
}

impl From<ModelError> for TrainError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainError> for io::Error {
    fn from(value: TrainError) -> Self {
        match value {
            TrainError::Comm(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
