//! IPC endpoint definitions for PIE communication.
//!
//! The engine listens on three unix-domain sockets under a per-user cache
//! directory; clients dial them. PIE uses NNG (nanomsg-next-gen) transports.

use std::path::PathBuf;

/// Shared cache directory for engine coordination state.
///
/// `$XDG_CACHE_HOME` / `~/Library/Caches` / `~/.cache` plus the vendor
/// directory, matching the Python and Swift clients.
pub fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("com.theproxycompany")
}

/// Root directory for IPC socket files.
///
/// All Grove processes on a host must agree on this location, otherwise they
/// will not find the engine's sockets. `ORCHARD_IPC_ROOT` is an escape hatch
/// for development and containerized environments.
pub fn ipc_root() -> PathBuf {
    if let Ok(root) = std::env::var("ORCHARD_IPC_ROOT") {
        return PathBuf::from(root);
    }

    let path = cache_root().join("ipc");
    std::fs::create_dir_all(&path).ok();
    path
}

fn as_ipc_url(path: PathBuf) -> String {
    format!("ipc://{}", path.display())
}

/// Endpoint for submitting inference requests.
/// Pattern: PUSH/PULL (many clients push, one engine pulls).
pub fn request_url() -> String {
    as_ipc_url(ipc_root().join("pie_requests.ipc"))
}

/// Endpoint for response deltas and broadcast events.
/// Pattern: PUB/SUB (one engine publishes, many clients subscribe by topic).
pub fn response_url() -> String {
    as_ipc_url(ipc_root().join("pie_responses.ipc"))
}

/// Endpoint for synchronous management commands (e.g. `load_model`).
/// Pattern: REQ/REP.
pub fn management_url() -> String {
    as_ipc_url(ipc_root().join("pie_management.ipc"))
}

/// Topic prefix for response deltas addressed to a single client.
pub const RESPONSE_TOPIC_PREFIX: &[u8] = b"resp:";

/// Topic prefix for broadcast engine events (telemetry, model_loaded, ...).
/// Event frames are `__PIE_EVENT__:<name>\x00<json>`; the NUL byte is the
/// sole separator between topic and body.
pub const EVENT_TOPIC_PREFIX: &[u8] = b"__PIE_EVENT__:";

/// Full response topic for a channel id: `resp:<hex(channel_id)>:`.
pub fn response_topic(channel_id: u64) -> Vec<u8> {
    let mut topic = RESPONSE_TOPIC_PREFIX.to_vec();
    topic.extend_from_slice(format!("{:x}:", channel_id).as_bytes());
    topic
}
