//! Health status types for the slot manager.

use serde::{Deserialize, Serialize};

/// Health status of the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Startup reconciliation not finished
    #[default]
    Starting,
    /// Accepting allocations
    Ready,
    /// Draining; no new allocations
    ShuttingDown,
}

/// Response-only health status. BUSY is derived from slot occupancy and
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthResponse {
    Starting,
    Ready,
    /// Ready but every slot is occupied
    Busy,
    ShuttingDown,
}

impl From<Health> for HealthResponse {
    fn from(health: Health) -> Self {
        match health {
            Health::Starting => HealthResponse::Starting,
            Health::Ready => HealthResponse::Ready,
            Health::ShuttingDown => HealthResponse::ShuttingDown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_default_is_starting() {
        assert_eq!(Health::default(), Health::Starting);
    }

    #[test]
    fn health_response_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                HealthResponse::Starting,
                HealthResponse::Ready,
                HealthResponse::Busy,
                HealthResponse::ShuttingDown,
            ],
            @r#"
        [
          "STARTING",
          "READY",
          "BUSY",
          "SHUTTING_DOWN"
        ]
        "#
        );
    }

    #[test]
    fn health_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<Health>("\"SHUTTING_DOWN\"").unwrap(),
            Health::ShuttingDown
        );
    }

    #[test]
    fn health_converts_to_response() {
        assert_eq!(HealthResponse::from(Health::Ready), HealthResponse::Ready);
        assert_eq!(
            HealthResponse::from(Health::Starting),
            HealthResponse::Starting
        );
    }
}
