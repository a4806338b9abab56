use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Stage,
    ServerStart,
    ServerReady,
    ClientStart,
    ClientDone,
    ServerStop,
    Collect,
    Bundle,
    Done,
    Error,
    Cancelled,
}

impl Phase {
    /// Every phase a successful run passes through, in order.
    pub const SEQUENCE: [Phase; 10] = [
        Phase::Init,
        Phase::Stage,
        Phase::ServerStart,
        Phase::ServerReady,
        Phase::ClientStart,
        Phase::ClientDone,
        Phase::ServerStop,
        Phase::Collect,
        Phase::Bundle,
        Phase::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Stage => "stage",
            Phase::ServerStart => "server_start",
            Phase::ServerReady => "server_ready",
            Phase::ClientStart => "client_start",
            Phase::ClientDone => "client_done",
            Phase::ServerStop => "server_stop",
            Phase::Collect => "collect",
            Phase::Bundle => "bundle",
            Phase::Done => "done",
            Phase::Error => "error",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseUpdate {
    pub phase: Phase,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl PhaseUpdate {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Notified synchronously on every phase transition, on the controller's task.
pub trait PhaseObserver: Send + Sync {
    fn on_phase(&self, update: &PhaseUpdate);
}

impl<F> PhaseObserver for F
where
    F: Fn(&PhaseUpdate) + Send + Sync,
{
    fn on_phase(&self, update: &PhaseUpdate) {
        self(update)
    }
}

impl PhaseObserver for mpsc::UnboundedSender<PhaseUpdate> {
    fn on_phase(&self, update: &PhaseUpdate) {
        if self.send(update.clone()).is_err() {
            tracing::trace!(phase = %update.phase, "phase receiver dropped");
        }
    }
}
