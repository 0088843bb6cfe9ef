//! Model management: identifier resolution and the load state machine.

pub mod registry;
pub mod resolver;

use std::path::PathBuf;

use thiserror::Error;

pub use registry::{ModelEntry, ModelInfo, ModelLoadState, ModelRegistry};
pub use resolver::{ModelResolver, ResolvedModel};

/// Model resolution and load errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model identifier is empty")]
    EmptyIdentifier,

    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("config.json missing under {0}")]
    MissingConfig(PathBuf),

    #[error("model '{id}' failed to load: {reason}")]
    LoadFailed { id: String, reason: String },

    #[error("engine rejected load of model '{id}': {reason}")]
    LoadRejected { id: String, reason: String },

    #[error("model '{0}' failed to activate")]
    ActivationFailed(String),

    #[error("model '{0}' is not on disk and downloads are unsupported")]
    DownloadUnsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
