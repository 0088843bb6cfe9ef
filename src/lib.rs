//! Grove - Rust host library for the Proxy Inference Engine (PIE).
//!
//! Grove brokers access to the engine subprocess shared by every client on
//! a host: it manages the engine's lifecycle through a cross-process lease,
//! speaks the three-socket NNG IPC protocol, tracks model load state, and
//! turns structured conversations into the engine's framed binary requests.
//!
//! ```no_run
//! use grove::{ChatParams, Client, EngineLease};
//!
//! # async fn demo() -> grove::Result<()> {
//! let lease = EngineLease::acquire().await?;
//! let client = Client::new(&lease)?;
//!
//! let response = client
//!     .chat(
//!         "meta-llama/Llama-3.1-8B-Instruct",
//!         vec![grove::text_message("user", "Hello!")],
//!         ChatParams::default(),
//!     )
//!     .await?;
//! println!("{}", response.text);
//! # Ok(())
//! # }
//! ```

mod defaults;
pub mod error;

pub mod client;
pub mod context;
pub mod engine;
pub mod formatter;
pub mod ipc;
pub mod model;

pub use error::{Error, Result};

pub use context::{current_context, last_telemetry, EngineContext};

pub use client::{
    text_message, ChatMessage, ChatParams, ChatStream, Client, ClientResponse, UsageStats,
    VisionClient,
};
pub use client::{BoundingBox, PointCoord};

pub use engine::fetch::EngineFetcher;
pub use engine::lease::{EngineLease, EnginePaths};
pub use engine::telemetry::{EngineHealth, TelemetrySnapshot};

pub use formatter::multimodal::{ContentPart, Interaction, MultimodalError};
pub use formatter::{ChatFormatter, ControlTokens, Role, RoleTags};

pub use ipc::endpoints;
pub use ipc::state::{ClientDelta, IpcState};
pub use ipc::wire::{
    build_request_frame, decode_request_frame, CapabilityBlob, LayoutEntry, PromptPayload,
    RequestType, SegmentType,
};

pub use model::registry::{ModelInfo, ModelLoadState, ModelRegistry};
pub use model::resolver::{ModelResolver, ResolvedModel};
pub use model::ModelError;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
