use crate::error::TransportError;
use crate::process::{supervise, ProcessHandle, SupervisorConfig};
use crate::transport::{RoleLaunch, RoleProcess, StageRequest, StagedRole, Transport};
use async_trait::async_trait;
use cip_core::Role;
use cip_manifest::TransportKind;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs the role as a child of the controller process.
pub struct LocalTransport {
    role: Role,
    kind: TransportKind,
    cancel_grace: Duration,
    process: Mutex<Option<ProcessHandle>>,
}

impl LocalTransport {
    pub fn new(role: Role, cancel_grace: Duration) -> Self {
        Self {
            role,
            kind: TransportKind::Local,
            cancel_grace,
            process: Mutex::new(None),
        }
    }

    fn handle(&self) -> Option<ProcessHandle> {
        self.process.lock().ok().and_then(|process| process.clone())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> &TransportKind {
        &self.kind
    }

    async fn stage(
        &self,
        request: &StageRequest,
        _cancel: &CancellationToken,
    ) -> Result<StagedRole, TransportError> {
        Ok(StagedRole {
            role: self.role,
            workdir: None,
            profile_path: request.profile.as_ref().map(|p| p.path.clone()),
        })
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        launch: &RoleLaunch,
    ) -> Result<RoleProcess, TransportError> {
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &launch.workdir {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|err| {
            TransportError::start_failed(
                self.role,
                format!("failed to spawn {}: {}", launch.program, err),
            )
        })?;
        let supervised = supervise(
            child,
            SupervisorConfig {
                role: self.role,
                cancel_grace: self.cancel_grace,
                terminate_on_stop: true,
                classify: None,
            },
            cancel.clone(),
        );
        tracing::info!(
            role = %self.role,
            pid = ?supervised.handle.pid(),
            command = %launch.command_line(),
            "started local role"
        );
        if let Ok(mut process) = self.process.lock() {
            *process = Some(supervised.handle);
        }
        Ok(RoleProcess {
            events: supervised.events,
            done: supervised.done,
        })
    }

    async fn stop(&self, grace: Duration) {
        if let Some(handle) = self.handle() {
            handle.stop(grace).await;
        }
    }

    fn is_alive(&self) -> bool {
        self.handle().map(|h| h.is_alive()).unwrap_or(false)
    }
}
