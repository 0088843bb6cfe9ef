//! IPC transport for the Proxy Inference Engine.
//!
//! Three NNG channels: request fan-in (push), response fan-out (subscribe
//! with topic prefixes), and synchronous management (request/reply).

pub mod endpoints;
pub mod sockets;
pub mod state;
pub mod wire;
