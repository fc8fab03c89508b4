//! Runtime health and setup-phase reporting.

use serde::{Deserialize, Serialize};

/// Health of the runtime as reported by `/health-check`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Running setup.
    #[default]
    Starting,
    /// Ready to accept a prediction.
    Ready,
    /// The prediction slot is occupied.
    Busy,
    /// Setup failed; the runtime will not become ready.
    SetupFailed,
    /// Unrecoverable worker failure; the process should be replaced.
    Defunct,
}

impl Health {
    /// DEFUNCT and SETUP_FAILED shed load: no prediction will ever be
    /// accepted again without a restart.
    pub fn refuses_work(&self) -> bool {
        matches!(self, Self::SetupFailed | Self::Defunct)
    }
}

/// Status of the setup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Starting,
    Succeeded,
    Failed,
}

/// Result of the setup phase, exposed under `setup` in `/health-check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResult {
    /// When setup started (RFC 3339).
    pub started_at: String,
    /// When setup completed (RFC 3339), if finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Status of setup.
    pub status: SetupStatus,
    /// Captured logs during setup.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
    /// Error detail when setup failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SetupResult {
    pub fn starting() -> Self {
        Self {
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            status: SetupStatus::Starting,
            logs: String::new(),
            error: None,
        }
    }

    pub fn succeeded(mut self, logs: String) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = SetupStatus::Succeeded;
        self.logs = logs;
        self
    }

    pub fn failed(mut self, logs: String, error: impl Into<String>) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = SetupStatus::Failed;
        self.logs = logs;
        self.error = Some(error.into());
        self
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
    fn health_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                Health::Starting,
                Health::Ready,
                Health::Busy,
                Health::SetupFailed,
                Health::Defunct,
            ],
            @r#"
        [
          "STARTING",
          "READY",
          "BUSY",
          "SETUP_FAILED",
          "DEFUNCT"
        ]
        "#
        );
    }

    #[test]
    fn health_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<Health>("\"READY\"").unwrap(),
            Health::Ready
        );
        assert_eq!(
            serde_json::from_str::<Health>("\"SETUP_FAILED\"").unwrap(),
            Health::SetupFailed
        );
    }

    #[test]
    fn refuses_work_states() {
        assert!(!Health::Starting.refuses_work());
        assert!(!Health::Ready.refuses_work());
        assert!(!Health::Busy.refuses_work());
        assert!(Health::SetupFailed.refuses_work());
        assert!(Health::Defunct.refuses_work());
    }

    #[test]
    fn setup_result_lifecycle() {
        let result = SetupResult::starting();
        assert_eq!(result.status, SetupStatus::Starting);
        assert!(result.completed_at.is_none());

        let ok = result.clone().succeeded("loaded weights\n".to_string());
        assert_eq!(ok.status, SetupStatus::Succeeded);
        assert!(ok.completed_at.is_some());
        assert_eq!(ok.logs, "loaded weights\n");
        assert!(ok.error.is_none());

        let failed = result.failed("traceback\n".to_string(), "boom");
        assert_eq!(failed.status, SetupStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn setup_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(SetupStatus::Succeeded).unwrap(),
            serde_json::json!("succeeded")
        );
        assert_eq!(
            serde_json::to_value(SetupStatus::Failed).unwrap(),
            serde_json::json!("failed")
        );
    }
}
