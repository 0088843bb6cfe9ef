//! Engine subprocess management: fetching, leasing, and telemetry.

pub mod fetch;
pub mod lease;
pub mod process;
pub mod telemetry;

pub use fetch::EngineFetcher;
pub use lease::{EngineLease, EnginePaths};
pub use telemetry::TelemetrySnapshot;
