use crate::error::TransportError;
use crate::local::LocalTransport;
use crate::mux::OutputEvent;
use crate::options::ControllerOptions;
use crate::process::ExitResult;
use crate::ssh::{SshConfig, SshTransport};
use async_trait::async_trait;
use cip_core::{shell_join, Role, CIPLAB_ENV_ROLE, CIPLAB_ENV_RUN_ID};
use cip_manifest::{Manifest, Profile, TransportKind};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    pub run_id: String,
    pub role: Role,
    pub profile: Option<Profile>,
}

/// Where a role will run once staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedRole {
    pub role: Role,
    /// Working directory on the agent, when the transport prepared one.
    pub workdir: Option<String>,
    /// Profile path as the role process should see it.
    pub profile_path: Option<String>,
}

/// Argv and environment of one role process, independent of where it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleLaunch {
    pub role: Role,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
}

impl RoleLaunch {
    /// Builds the role's command line from the manifest. A profile copy staged
    /// by the transport replaces the manifest's profile path.
    pub fn for_role(
        manifest: &Manifest,
        role: Role,
        executable: &str,
        staged: Option<&StagedRole>,
    ) -> Option<Self> {
        let data_plane = &manifest.network.data_plane;
        let mut args = match role {
            Role::Server => {
                let server = manifest.roles.server.as_ref()?;
                vec![
                    "server".to_string(),
                    "--listen-ip".to_string(),
                    data_plane.server_listen_ip.clone(),
                    "--mode".to_string(),
                    server.mode.clone(),
                    "--personality".to_string(),
                    server.personality.clone(),
                ]
            }
            Role::Client => {
                let client = manifest.roles.client.as_ref()?;
                vec![
                    "client".to_string(),
                    "--ip".to_string(),
                    data_plane.target_ip.clone(),
                    "--port".to_string(),
                    data_plane.target_port.to_string(),
                    "--scenario".to_string(),
                    client.scenario.clone(),
                    "--duration-seconds".to_string(),
                    client.duration_seconds.to_string(),
                    "--interval-ms".to_string(),
                    client.interval_ms.to_string(),
                ]
            }
        };
        let profile_path = staged
            .and_then(|staged| staged.profile_path.clone())
            .or_else(|| manifest.profile.as_ref().map(|p| p.path.clone()));
        if let Some(path) = profile_path {
            args.push("--config".to_string());
            args.push(path);
        }
        Some(Self {
            role,
            program: executable.to_string(),
            args,
            env: vec![
                (CIPLAB_ENV_RUN_ID.to_string(), manifest.run_id.clone()),
                (CIPLAB_ENV_ROLE.to_string(), role.as_str().to_string()),
            ],
            workdir: staged.and_then(|staged| staged.workdir.clone()),
        })
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn command_line(&self) -> String {
        shell_join(&self.argv())
    }
}

/// A started role: its output stream and a one-shot exit report.
pub struct RoleProcess {
    pub events: mpsc::UnboundedReceiver<OutputEvent>,
    pub done: oneshot::Receiver<ExitResult>,
}

/// Execution context of one role.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> &TransportKind;

    /// Prepares the agent for the role. Called once per run before `start`.
    async fn stage(
        &self,
        request: &StageRequest,
        cancel: &CancellationToken,
    ) -> Result<StagedRole, TransportError>;

    /// Spawns the role process and returns once it exists. Cancelling `cancel`
    /// terminates the process.
    async fn start(
        &self,
        cancel: &CancellationToken,
        launch: &RoleLaunch,
    ) -> Result<RoleProcess, TransportError>;

    /// Terminates the process, escalating to a kill after `grace`. Idempotent.
    async fn stop(&self, grace: Duration);

    fn is_alive(&self) -> bool;
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        role: Role,
        kind: &TransportKind,
        options: &ControllerOptions,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        role: Role,
        kind: &TransportKind,
        options: &ControllerOptions,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(match kind {
            TransportKind::Local => Arc::new(LocalTransport::new(role, options.stop_grace)),
            TransportKind::Ssh(target) => Arc::new(SshTransport::new(
                role,
                target.clone(),
                SshConfig::from_options(options),
            )),
        })
    }
}
