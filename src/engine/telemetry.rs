//! Telemetry snapshots broadcast by the engine.
//!
//! The engine publishes a periodic `telemetry` event; the first one doubles
//! as the readiness signal during startup. Parsing is lenient: unknown
//! fields are ignored and missing fields default to zero.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine process health, nested under `health` in the telemetry payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineHealth {
    pub pid: u32,
    pub status: Option<String>,
    pub uptime_seconds: Option<f64>,
}

/// One telemetry event payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySnapshot {
    pub health: EngineHealth,
    pub gpu_total_bytes: u64,
    pub gpu_reserved_bytes: u64,
    pub gpu_active_bytes: u64,
    pub requests_in_flight: u64,
    pub tokens_per_second: Option<f64>,
}

impl TelemetrySnapshot {
    /// Parse a telemetry payload; `None` when the shape is unusable.
    pub fn parse(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    /// Fraction of GPU memory reserved, in `[0, 1]`. Zero capacity reports
    /// zero utilization.
    pub fn gpu_utilization(&self) -> f64 {
        if self.gpu_total_bytes == 0 {
            0.0
        } else {
            self.gpu_reserved_bytes as f64 / self.gpu_total_bytes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_is_reserved_over_total() {
        let snapshot = TelemetrySnapshot::parse(&serde_json::json!({
            "gpu_total_bytes": 100,
            "gpu_reserved_bytes": 75,
            "gpu_active_bytes": 50,
        }))
        .unwrap();
        assert!((snapshot.gpu_utilization() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_capacity_is_zero_utilization() {
        let snapshot = TelemetrySnapshot::parse(&serde_json::json!({
            "gpu_total_bytes": 0,
            "gpu_reserved_bytes": 0,
        }))
        .unwrap();
        assert_eq!(snapshot.gpu_utilization(), 0.0);
    }

    #[test]
    fn health_pid_is_extracted() {
        let snapshot = TelemetrySnapshot::parse(&serde_json::json!({
            "health": {"pid": 4242, "status": "serving"},
            "unknown_field": true,
        }))
        .unwrap();
        assert_eq!(snapshot.health.pid, 4242);
        assert_eq!(snapshot.health.status.as_deref(), Some("serving"));
    }
}
