//! Supervision of one role process, shared by the local and SSH transports.
//!
//! The supervisor task owns the child. Two reader tasks turn stdout and stderr
//! into `OutputEvent`s; the supervisor waits for the first of exit,
//! cancellation or a stop request, runs terminate, grace, kill as needed and
//! reports an `ExitResult` once the readers have drained.

use crate::error::TransportError;
use crate::mux::{OutputEvent, StreamKind};
use cip_core::Role;
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bound on draining output after the process is gone.
pub(crate) const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Exited on its own.
    Exited,
    /// Exited within the grace period after a stop request.
    Stopped,
    /// Exited within the grace period after cancellation.
    Cancelled,
    /// Force killed after the grace period.
    Killed,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Exited => "exited",
            Termination::Stopped => "stopped",
            Termination::Cancelled => "cancelled",
            Termination::Killed => "killed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitResult {
    pub code: Option<i32>,
    pub termination: Termination,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the exit is the transport failing rather than the role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_error: Option<TransportError>,
    #[serde(skip)]
    pub stderr_tail: Vec<String>,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.transport_error.is_none()
    }

    /// Terminated by us rather than by itself.
    pub fn was_requested(&self) -> bool {
        self.termination != Termination::Exited
    }

    pub(crate) fn lost(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            termination: Termination::Killed,
            error: Some(reason.into()),
            transport_error: None,
            stderr_tail: Vec::new(),
        }
    }
}

/// Maps an exit code and the stderr tail to a transport failure, if it is one.
pub(crate) type ExitClassifier = fn(Role, Option<i32>, &[String]) -> Option<TransportError>;

pub(crate) struct SupervisorConfig {
    pub(crate) role: Role,
    /// Grace between terminate and kill when the run is cancelled.
    pub(crate) cancel_grace: Duration,
    /// Send SIGTERM to the child on a stop request. Off when the transport
    /// delivers the terminate itself.
    pub(crate) terminate_on_stop: bool,
    pub(crate) classify: Option<ExitClassifier>,
}

pub(crate) struct Supervised {
    pub(crate) events: mpsc::UnboundedReceiver<OutputEvent>,
    pub(crate) done: oneshot::Receiver<ExitResult>,
    pub(crate) handle: ProcessHandle,
}

/// Control side of a supervised process; cheap to clone.
#[derive(Clone)]
pub(crate) struct ProcessHandle {
    pid: Option<u32>,
    stop: Arc<watch::Sender<Option<Duration>>>,
    alive: watch::Receiver<bool>,
}

impl ProcessHandle {
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Asks the supervisor to stop the process and waits until it is gone.
    pub(crate) async fn stop(&self, grace: Duration) {
        if self.request_stop(grace) {
            self.wait_gone(grace + IO_CAPTURE_TIMEOUT).await;
        }
    }

    /// Marks the process as being stopped; the supervisor kills it if it is
    /// still running after `grace`. Returns false when there is nothing to stop.
    pub(crate) fn request_stop(&self, grace: Duration) -> bool {
        self.is_alive() && self.stop.send(Some(grace)).is_ok()
    }

    /// Resolves once the supervisor has reported the exit.
    pub(crate) async fn exited(&self) {
        let mut alive = self.alive.clone();
        while *alive.borrow_and_update() {
            if alive.changed().await.is_err() {
                break;
            }
        }
    }

    pub(crate) async fn wait_gone(&self, limit: Duration) {
        if tokio::time::timeout(limit, self.exited()).await.is_err() {
            tracing::warn!(pid = ?self.pid, "process still running after stop");
        }
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    Stop(Duration),
}

pub(crate) fn supervise(
    mut child: Child,
    config: SupervisorConfig,
    cancel: CancellationToken,
) -> Supervised {
    let role = config.role;
    let pid = child.id();
    let (tx, events) = mpsc::unbounded_channel();
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(
            stdout,
            role,
            StreamKind::Stdout,
            tx.clone(),
            None,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(
            stderr,
            role,
            StreamKind::Stderr,
            tx.clone(),
            Some(tail.clone()),
        )));
    }
    drop(tx);

    let (stop_tx, mut stop_rx) = watch::channel(None::<Duration>);
    let (alive_tx, alive_rx) = watch::channel(true);
    let (done_tx, done) = oneshot::channel();

    tokio::spawn(async move {
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Cancelled,
            grace = stop_requested(&mut stop_rx) => Outcome::Stop(grace),
        };
        let (status, termination) = match outcome {
            Outcome::Exited(status) => (status, Termination::Exited),
            Outcome::Cancelled => {
                tracing::debug!(role = %role, "cancelled; terminating process");
                request_terminate(&mut child, role);
                wait_or_kill(&mut child, config.cancel_grace, Termination::Cancelled, role).await
            }
            Outcome::Stop(grace) => {
                if config.terminate_on_stop {
                    request_terminate(&mut child, role);
                }
                wait_or_kill(&mut child, grace, Termination::Stopped, role).await
            }
        };

        for mut reader in readers {
            if tokio::time::timeout(IO_CAPTURE_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                tracing::warn!(role = %role, "output reader did not drain; abandoning it");
                reader.abort();
            }
        }

        let stderr_tail: Vec<String> = tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default();
        let (code, error) = match status {
            Ok(status) => (status.code(), None),
            Err(err) => (None, Some(format!("failed waiting for process: {}", err))),
        };
        let transport_error = config
            .classify
            .and_then(|classify| classify(role, code, &stderr_tail));
        let result = ExitResult {
            code,
            termination,
            error,
            transport_error,
            stderr_tail,
        };
        tracing::debug!(
            role = %role,
            code = ?result.code,
            termination = result.termination.as_str(),
            "process finished"
        );

        let _ = alive_tx.send(false);
        if done_tx.send(result).is_err() {
            tracing::trace!(role = %role, "exit result receiver dropped");
        }
    });

    Supervised {
        events,
        done,
        handle: ProcessHandle {
            pid,
            stop: Arc::new(stop_tx),
            alive: alive_rx,
        },
    }
}

async fn stop_requested(rx: &mut watch::Receiver<Option<Duration>>) -> Duration {
    loop {
        if let Some(grace) = *rx.borrow_and_update() {
            return grace;
        }
        if rx.changed().await.is_err() {
            // Every handle is gone; only exit or cancellation can end the process now.
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_or_kill(
    child: &mut Child,
    grace: Duration,
    graceful: Termination,
    role: Role,
) -> (io::Result<ExitStatus>, Termination) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => (status, graceful),
        Err(_) => {
            tracing::warn!(role = %role, grace_ms = grace.as_millis() as u64, "grace period elapsed; killing process");
            if let Err(err) = child.kill().await {
                tracing::warn!(role = %role, error = %err, "kill failed");
            }
            (child.wait().await, Termination::Killed)
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child, role: Role) {
    let Some(pid) = child.id() else {
        return;
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::warn!(role = %role, pid, error = %io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child, role: Role) {
    if let Err(err) = child.start_kill() {
        tracing::warn!(role = %role, error = %err, "terminate failed");
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(
    reader: R,
    role: Role,
    stream: StreamKind,
    tx: mpsc::UnboundedSender<OutputEvent>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if let Some(tail) = &tail {
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                }
                // Keep draining after the consumer is gone so the child never blocks on a full pipe.
                let _ = tx.send(OutputEvent::new(role, stream, line));
            }
            Err(err) => {
                tracing::warn!(role = %role, stream = %stream, error = %err, "output read failed");
                break;
            }
        }
    }
}
