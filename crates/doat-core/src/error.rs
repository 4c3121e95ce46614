//! Error taxonomy for runs, collectors and analysis.

use std::path::PathBuf;

use thiserror::Error;

use crate::controller::RunPhase;
use crate::process::Role;
use crate::telemetry::ProtocolStage;

/// Every failure the harness can report.
#[derive(Debug, Error)]
pub enum DoatError {
    /// The OS refused to start a supervised process.
    #[error("failed to spawn {role}: {source}")]
    SpawnFailed {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    /// A supervised process was found dead while it was required alive.
    #[error("{role} died or failed to start during {phase}")]
    LivenessLost { role: Role, phase: RunPhase },

    /// The pass ran to completion but its data cannot be trusted.
    #[error("pass invalid: {reason}")]
    PassInvalid { reason: String },

    #[error("telemetry protocol error during {stage}: {detail}")]
    Protocol { stage: ProtocolStage, detail: String },

    /// An anchor/offset column lookup did not resolve.
    #[error("column not found: anchor '{anchor}' offset {offset}")]
    ColumnNotFound { anchor: String, offset: usize },

    #[error("malformed artifact {}: {detail}", .path.display())]
    MalformedArtifact { path: PathBuf, detail: String },

    #[error("series {tag} has no samples")]
    EmptySeries { tag: String },

    /// Two series that were expected to line up do not.
    #[error("series mismatch: {detail}")]
    SeriesMismatch { detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration mutation of {} failed: {detail}", .path.display())]
    Mutation { path: PathBuf, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DoatError>;

impl DoatError {
    /// The supervised component responsible for this error, if any.
    pub fn failed_role(&self) -> Option<Role> {
        match self {
            Self::SpawnFailed { role, .. } | Self::LivenessLost { role, .. } => Some(*role),
            Self::Protocol { .. } => Some(Role::TelemetryClient),
            _ => None,
        }
    }

    /// Operator-facing hint for fixing the failure.
    pub fn remediation(&self) -> Option<&'static str> {
        match self.failed_role()? {
            Role::HwCounterSampler => {
                Some("if the problem persists, try executing 'modprobe msr' as the root user")
            }
            Role::PowerSampler => {
                Some("check that ipmitool is installed and the BMC reports the configured power sensor")
            }
            Role::TelemetryClient => {
                Some("check that the application was built with telemetry and is reachable on its socket")
            }
            Role::Target => Some("run the application command by hand to check it starts cleanly"),
            Role::Builder => None,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::MalformedArtifact {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_message_names_role_and_phase() {
        let err = DoatError::LivenessLost {
            role: Role::HwCounterSampler,
            phase: RunPhase::CollectorsStarting,
        };
        assert_eq!(
            err.to_string(),
            "hw-counter-sampler died or failed to start during collectors-starting"
        );
    }

    #[test]
    fn test_hw_counter_remediation_mentions_msr() {
        let err = DoatError::LivenessLost {
            role: Role::HwCounterSampler,
            phase: RunPhase::CollectorsStarting,
        };
        assert!(err.remediation().unwrap().contains("modprobe msr"));
    }

    #[test]
    fn test_column_not_found_has_no_role() {
        let err = DoatError::ColumnNotFound {
            anchor: "Socket 0".to_string(),
            offset: 13,
        };
        assert!(err.failed_role().is_none());
        assert!(err.remediation().is_none());
        assert_eq!(err.to_string(), "column not found: anchor 'Socket 0' offset 13");
    }

    #[test]
    fn test_protocol_error_blames_telemetry_client() {
        let err = DoatError::Protocol {
            stage: ProtocolStage::Parse,
            detail: "missing counter".to_string(),
        };
        assert_eq!(err.failed_role(), Some(Role::TelemetryClient));
    }
}
