//! Crate-level error type for Grove.
//!
//! Each subsystem defines its own error enum next to the code that raises it;
//! this module aggregates them so callers only ever see one `Error`.

use thiserror::Error;

/// Grove error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The process-wide engine context has not been initialised.
    #[error("engine context not initialised; acquire an EngineLease first")]
    NotInitialized,

    /// No model identifier was supplied to a chat operation.
    #[error("no model specified")]
    NoModelSpecified,

    /// The lease backing this client has already been closed.
    #[error("engine lease is closed")]
    Closed,

    /// A management command did not receive a reply in time.
    #[error("management command timed out")]
    Timeout,

    /// The delta channel closed before the request completed.
    #[error("delta channel closed")]
    ChannelClosed,

    /// Transport-layer failure (dial, send, receive).
    #[error(transparent)]
    Transport(#[from] crate::ipc::sockets::TransportError),

    /// Request frame serialization failure.
    #[error(transparent)]
    Wire(#[from] crate::ipc::wire::WireError),

    /// Chat formatter failure.
    #[error(transparent)]
    Formatter(#[from] crate::formatter::FormatterError),

    /// Multimodal content failure.
    #[error(transparent)]
    Multimodal(#[from] crate::formatter::multimodal::MultimodalError),

    /// Model resolution or load failure.
    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    /// Engine lease failure.
    #[error(transparent)]
    Lease(#[from] crate::engine::lease::LeaseError),

    /// Engine binary fetch failure.
    #[error(transparent)]
    Fetch(#[from] crate::engine::fetch::FetchError),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Grove operations.
pub type Result<T> = std::result::Result<T, Error>;
