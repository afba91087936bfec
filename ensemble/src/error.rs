use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire model kit.
pub type Result<T> = std::result::Result<T, ModelError>;

/// The model kit's error type.
#[derive(Debug)]
pub enum ModelError {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    DimMismatch {
        layer: usize,
        got: usize,
        expected: usize,
    },
    EmptyModel,
    TooFewLayers {
        layers: usize,
        parts: usize,
    },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelError::SizeMismatch {
                what,
                got,
                expected,
            } => {
                format!("There's a size mismatch in {what}, got {got} and expected {expected}")
            }
            ModelError::DimMismatch {
                layer,
                got,
                expected,
            } => format!(
                "Layer {layer} expects {expected} input columns but the previous one produces {got}"
            ),
            ModelError::EmptyModel => "A model needs at least one layer".to_string(),
            ModelError::TooFewLayers { layers, parts } => {
                format!("Cannot split {layers} layers into {parts} non-empty parts")
            }
        };

        write!(f, "{s}")
    }
}

impl Error for ModelError {}
