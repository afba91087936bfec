//! A minimal model kit over flat `f32` parameter buffers.
//!
//! Models compute from a borrowed flat parameter slice and accumulate into
//! a borrowed flat gradient slice; the `Layout` type maps both buffers
//! into per-layer regions. Forward passes return a `Tape` instead of
//! caching state inside the layers, so several micro-batches can be in
//! flight through the same model at once.

mod activation;
mod dense;
mod error;
mod init;
mod layout;
mod loss;
mod optim;
mod sequential;

pub use activation::ActFn;
pub use dense::{Dense, DenseCtx};
pub use error::{ModelError, Result};
pub use init::seeded_params;
pub use layout::Layout;
pub use loss::{LossFn, Mse, SoftmaxCrossEntropy};
pub use optim::{Adam, Optimizer, Sgd};
pub use sequential::{Sequential, Tape};
