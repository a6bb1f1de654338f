//! Error types for scene transition coordination.

use std::io;

use scene_sync_proto::{
    EventProgressId, PartitionHandle, PartitionId, ProtoError,
};

/// Errors surfaced by the coordinator.
///
/// Rejected-request variants are synchronous, non-fatal outcomes of the
/// public API. `ProtocolViolation` indicates message duplication, corruption,
/// or a broken invariant and must never be masked by best-effort recovery.
/// Timed-out peers are not errors; they are reported in the completion
/// broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneSyncError {
    SceneManagementDisabled,
    NotAuthority { node_id: String },
    TransitionInProgress { active: EventProgressId },
    UnknownPartition { partition_id: PartitionId },
    PartitionNotLoaded { partition_handle: PartitionHandle },
    ExclusiveUnloadDenied { partition_handle: PartitionHandle },
    VerificationRejected { partition_id: PartitionId },
    RuntimeRegistrationDisabled,
    ProtocolViolation { reason: String },
    Channel { topic: String, reason: String },
    Io(String),
    Serde(String),
}

impl SceneSyncError {
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SceneSyncError::SceneManagementDisabled
                | SceneSyncError::NotAuthority { .. }
                | SceneSyncError::TransitionInProgress { .. }
                | SceneSyncError::UnknownPartition { .. }
                | SceneSyncError::PartitionNotLoaded { .. }
                | SceneSyncError::ExclusiveUnloadDenied { .. }
                | SceneSyncError::VerificationRejected { .. }
                | SceneSyncError::RuntimeRegistrationDisabled
        )
    }
}

impl From<ProtoError> for SceneSyncError {
    fn from(error: ProtoError) -> Self {
        match error {
            ProtoError::Serde(message) => SceneSyncError::Serde(message),
            ProtoError::ChannelUnavailable { topic } => SceneSyncError::Channel {
                topic,
                reason: "unavailable".to_string(),
            },
            ProtoError::MalformedRecord { reason } => SceneSyncError::ProtocolViolation { reason },
        }
    }
}

impl From<serde_cbor::Error> for SceneSyncError {
    fn from(error: serde_cbor::Error) -> Self {
        SceneSyncError::Serde(error.to_string())
    }
}

impl From<serde_json::Error> for SceneSyncError {
    fn from(error: serde_json::Error) -> Self {
        SceneSyncError::Serde(error.to_string())
    }
}

impl From<io::Error> for SceneSyncError {
    fn from(error: io::Error) -> Self {
        SceneSyncError::Io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_distinguished_from_violations() {
        assert!(SceneSyncError::SceneManagementDisabled.is_rejection());
        assert!(SceneSyncError::TransitionInProgress {
            active: EventProgressId::new(1, 1)
        }
        .is_rejection());
        assert!(!SceneSyncError::ProtocolViolation {
            reason: "dup".to_string()
        }
        .is_rejection());
    }

    #[test]
    fn malformed_records_surface_as_protocol_violations() {
        let err: SceneSyncError = ProtoError::MalformedRecord {
            reason: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, SceneSyncError::ProtocolViolation { .. }));
    }
}
