//! Error types for subspace-sgd-rs.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! is [`SubspaceError`]. Errors raised by the tensor library, the filesystem
//! and the serializers convert automatically through `?`.
//!
//! # Example
//!
//! ```rust
//! use subspace_sgd_rs::{ExperimentConfig, SubspaceError};
//!
//! # fn main() {
//! match ExperimentConfig::from_preset("not-a-preset") {
//!     Ok(_) => println!("loaded"),
//!     Err(SubspaceError::Config(msg)) => eprintln!("configuration error: {msg}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # }
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for subspace-sgd-rs operations.
pub type Result<T> = std::result::Result<T, SubspaceError>;

/// Errors that can occur while sampling, decomposing or training.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SubspaceError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Checkpoint file could not be interpreted.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Requested checkpoint does not exist on disk.
    #[error("checkpoint {index} not found at {}", path.display())]
    CheckpointNotFound {
        /// Checkpoint index.
        index: usize,
        /// Expected location.
        path: PathBuf,
    },

    /// A run directory that must be fresh already exists.
    #[error("run directory already exists: {}", .0.display())]
    RunExists(PathBuf),

    /// Parameter shape differs from the model layout.
    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Vector or matrix dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Eigendecomposition produced an unusable basis.
    #[error("decomposition error: {0}")]
    Decomposition(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
