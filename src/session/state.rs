//! Transport state machine types.
//!
//! Exactly one `TransportState` is authoritative at a time. It is written
//! only by the session coordinator and handed to everyone else as an
//! immutable `SessionSnapshot`.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::bundle::StageError;
use crate::fallback::BindError;
use crate::sidecar::LaunchError;

/// Which transport is serving the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Sidecar,
    Fallback,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sidecar => write!(f, "sidecar"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Flattened failure taxonomy carried by `TransportState::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    SourceUnreadable { detail: String },
    WriteFailed { detail: String },
    MissingEntryPoint { detail: String },
    AlreadyActive,
    BridgeAllocationFailed,
    BridgeFault { code: i32 },
    PortInUse { port: u16 },
    PermissionDenied { port: u16 },
    BindFailed { detail: String },
    /// The sidecar never answered readiness probes.
    NotReady { detail: String },
}

impl From<&StageError> for FailureReason {
    fn from(err: &StageError) -> Self {
        let detail = err.to_string();
        match err {
            StageError::SourceUnreadable { .. } => Self::SourceUnreadable { detail },
            StageError::WriteFailed { .. } => Self::WriteFailed { detail },
            StageError::MissingEntryPoint { .. } => Self::MissingEntryPoint { detail },
        }
    }
}

impl From<&LaunchError> for FailureReason {
    fn from(err: &LaunchError) -> Self {
        match err {
            LaunchError::AlreadyActive => Self::AlreadyActive,
            LaunchError::BridgeAllocationFailed => Self::BridgeAllocationFailed,
            LaunchError::BridgeFault(code) => Self::BridgeFault { code: *code },
        }
    }
}

impl From<&BindError> for FailureReason {
    fn from(err: &BindError) -> Self {
        match err {
            BindError::PortInUse { port } => Self::PortInUse { port: *port },
            BindError::PermissionDenied { port } => Self::PermissionDenied { port: *port },
            BindError::Io { .. } => Self::BindFailed {
                detail: err.to_string(),
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceUnreadable { detail }
            | Self::WriteFailed { detail }
            | Self::MissingEntryPoint { detail }
            | Self::BindFailed { detail } => write!(f, "{}", detail),
            Self::AlreadyActive => write!(f, "{}", LaunchError::AlreadyActive),
            Self::BridgeAllocationFailed => write!(f, "{}", LaunchError::BridgeAllocationFailed),
            Self::BridgeFault { code } => write!(f, "{}", LaunchError::BridgeFault(*code)),
            Self::PortInUse { port } => write!(f, "port {} is already in use", port),
            Self::PermissionDenied { port } => write!(f, "permission denied binding port {}", port),
            Self::NotReady { detail } => write!(f, "sidecar not ready: {}", detail),
        }
    }
}

/// Lifecycle of the local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TransportState {
    Idle,
    StagingBundle,
    Launching,
    Running(Transport),
    Failed(FailureReason),
    Stopped,
}

impl TransportState {
    /// Idle, Failed and Stopped all accept a fresh start.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed(_) | Self::Stopped)
    }

    /// The sidecar path holds (or is about to hold) the port.
    pub fn sidecar_occupies_port(&self) -> bool {
        matches!(
            self,
            Self::StagingBundle | Self::Launching | Self::Running(Transport::Sidecar)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::StagingBundle => write!(f, "staging_bundle"),
            Self::Launching => write!(f, "launching"),
            Self::Running(transport) => write!(f, "running({})", transport),
            Self::Failed(reason) => write!(f, "failed({})", reason),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Immutable view of the session handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: TransportState,
    /// Currently selected bundle, if any.
    pub bundle: Option<String>,
    /// Single human-readable status line.
    pub status: String,
    /// Where operators find the details behind `status`.
    pub log_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(TransportState::Idle.to_string(), "idle");
        assert_eq!(
            TransportState::Running(Transport::Fallback).to_string(),
            "running(fallback)"
        );
        assert_eq!(
            TransportState::Failed(FailureReason::BridgeFault { code: 4 }).to_string(),
            "failed(sidecar runtime fault (code 4))"
        );
    }

    #[test]
    fn test_can_start() {
        assert!(TransportState::Idle.can_start());
        assert!(TransportState::Stopped.can_start());
        assert!(TransportState::Failed(FailureReason::AlreadyActive).can_start());
        assert!(!TransportState::Launching.can_start());
        assert!(!TransportState::Running(Transport::Sidecar).can_start());
    }

    #[test]
    fn test_sidecar_occupies_port() {
        assert!(TransportState::StagingBundle.sidecar_occupies_port());
        assert!(TransportState::Running(Transport::Sidecar).sidecar_occupies_port());
        assert!(!TransportState::Running(Transport::Fallback).sidecar_occupies_port());
        assert!(!TransportState::Idle.sidecar_occupies_port());
    }

    #[test]
    fn test_is_running() {
        assert!(TransportState::Running(Transport::Sidecar).is_running());
        assert!(TransportState::Running(Transport::Fallback).is_running());
        assert!(!TransportState::Launching.is_running());
        assert!(!TransportState::Stopped.is_running());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(TransportState::Running(Transport::Sidecar)).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["detail"], "sidecar");

        let json = serde_json::to_value(TransportState::Failed(FailureReason::PortInUse {
            port: 3000,
        }))
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["detail"]["kind"], "port_in_use");
        assert_eq!(json["detail"]["port"], 3000);
    }

    #[test]
    fn test_failure_reason_from_errors() {
        let stage = StageError::MissingEntryPoint {
            path: PathBuf::from("/data/files/weather/main.js"),
        };
        assert!(matches!(
            FailureReason::from(&stage),
            FailureReason::MissingEntryPoint { .. }
        ));
        assert_eq!(
            FailureReason::from(&LaunchError::BridgeFault(7)),
            FailureReason::BridgeFault { code: 7 }
        );
        assert_eq!(
            FailureReason::from(&BindError::PortInUse { port: 3000 }),
            FailureReason::PortInUse { port: 3000 }
        );
    }
}
