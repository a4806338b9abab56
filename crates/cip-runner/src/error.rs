use crate::phase::Phase;
use cip_core::Role;
use cip_manifest::ManifestError;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Unreachable,
    AuthFailed,
    HostKeyUntrusted,
    StartFailed,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Unreachable => "unreachable",
            TransportErrorKind::AuthFailed => "auth_failed",
            TransportErrorKind::HostKeyUntrusted => "host_key_untrusted",
            TransportErrorKind::StartFailed => "start_failed",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{role} transport {kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub role: Role,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, role: Role, message: impl Into<String>) -> Self {
        Self {
            kind,
            role,
            message: message.into(),
        }
    }

    pub fn start_failed(role: Role, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::StartFailed, role, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("server did not report ready within {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("server output closed before it reported ready")]
    ServerExited,
    #[error("readiness wait cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunErrorKind {
    Transport(TransportErrorKind),
    ReadinessTimeout,
    ReadinessFailed,
    Execution { exit_code: Option<i32> },
    Cancelled,
    DeadlineExceeded,
    Setup,
}

impl RunErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunErrorKind::Transport(_) => "transport",
            RunErrorKind::ReadinessTimeout => "readiness_timeout",
            RunErrorKind::ReadinessFailed => "readiness_failed",
            RunErrorKind::Execution { .. } => "execution",
            RunErrorKind::Cancelled => "cancelled",
            RunErrorKind::DeadlineExceeded => "deadline_exceeded",
            RunErrorKind::Setup => "setup",
        }
    }
}

/// The first failure of a run, as recorded on `RunResult` and in `summary.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub phase: Phase,
    pub role: Option<Role>,
    pub message: String,
}

impl RunError {
    pub fn new(
        kind: RunErrorKind,
        phase: Phase,
        role: Option<Role>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            phase,
            role,
            message: message.into(),
        }
    }

    pub fn transport(phase: Phase, err: &TransportError) -> Self {
        Self::new(
            RunErrorKind::Transport(err.kind),
            phase,
            Some(err.role),
            err.message.clone(),
        )
    }

    pub fn cancelled(phase: Phase) -> Self {
        Self::new(RunErrorKind::Cancelled, phase, None, "run cancelled")
    }

    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "kind": self.kind.as_str(),
            "phase": self.phase.as_str(),
            "role": self.role.map(Role::as_str),
            "message": self.message,
        });
        match self.kind {
            RunErrorKind::Transport(kind) => {
                value["transport_error"] = json!(kind.as_str());
            }
            RunErrorKind::Execution { exit_code } => {
                value["exit_code"] = json!(exit_code);
            }
            _ => {}
        }
        value
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.phase)?;
        if let Some(role) = self.role {
            write!(f, " for {}", role)?;
        }
        write!(f, " ({}): {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for RunError {}

impl Serialize for RunError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Errors returned by `Controller::new` and `Controller::run`. In-run failures
/// are not errors; they end up in `RunResult::error`.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("controller has already run")]
    AlreadyRan,
    #[error("controller is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_json_carries_kind_specific_fields() {
        let err = RunError::transport(
            Phase::Stage,
            &TransportError::new(TransportErrorKind::Unreachable, Role::Server, "timed out"),
        );
        let value = err.to_json();
        assert_eq!(value["kind"], "transport");
        assert_eq!(value["transport_error"], "unreachable");
        assert_eq!(value["role"], "server");
        assert_eq!(value["phase"], "stage");

        let err = RunError::new(
            RunErrorKind::Execution { exit_code: Some(3) },
            Phase::ClientDone,
            Some(Role::Client),
            "client exited with code 3",
        );
        assert_eq!(err.to_json()["exit_code"], 3);
        assert_eq!(
            err.to_string(),
            "client_done failed for client (execution): client exited with code 3"
        );
        assert_eq!(serde_json::to_value(&err).expect("serialize"), err.to_json());
    }
}
