//! Remote roles over the system `ssh` client.
//!
//! Every remote call is a separate `ssh` invocation in batch mode with strict
//! host key checking. The role process records its PID in the staged working
//! directory so a stop can deliver SIGTERM remotely before the local client is
//! torn down.

use crate::error::{TransportError, TransportErrorKind};
use crate::options::ControllerOptions;
use crate::process::{supervise, ProcessHandle, SupervisorConfig, IO_CAPTURE_TIMEOUT};
use crate::transport::{RoleLaunch, RoleProcess, StageRequest, StagedRole, Transport};
use async_trait::async_trait;
use cip_core::{shell_quote, Role};
use cip_manifest::{ProfileDistribution, SshTarget, TransportKind, DEFAULT_SSH_PORT};
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub const REMOTE_RUNS_DIR: &str = ".ciplab/runs";
pub const REMOTE_PID_FILE: &str = "role.pid";
/// Exit status the OpenSSH client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

const HOST_KEY_PATTERNS: &[&str] = &[
    "host key verification failed",
    "remote host identification has changed",
    "host key for",
];
const AUTH_PATTERNS: &[&str] = &[
    "permission denied",
    "too many authentication failures",
    "no supported authentication methods",
    "load key",
    "identity file",
];
const UNREACHABLE_PATTERNS: &[&str] = &[
    "connection timed out",
    "operation timed out",
    "connection refused",
    "could not resolve hostname",
    "name or service not known",
    "no route to host",
    "network is unreachable",
    "connection closed",
    "lost connection",
];

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub ssh_program: String,
    pub scp_program: String,
    pub connect_timeout: Duration,
    pub stop_grace: Duration,
}

impl SshConfig {
    pub fn from_options(options: &ControllerOptions) -> Self {
        Self {
            ssh_program: options.ssh_program.clone(),
            scp_program: options.scp_program.clone(),
            connect_timeout: options.connect_timeout,
            stop_grace: options.stop_grace,
        }
    }
}

pub struct SshTransport {
    role: Role,
    target: SshTarget,
    kind: TransportKind,
    config: SshConfig,
    workdir: Mutex<Option<String>>,
    process: Mutex<Option<ProcessHandle>>,
}

impl SshTransport {
    pub fn new(role: Role, target: SshTarget, config: SshConfig) -> Self {
        Self {
            role,
            kind: TransportKind::Ssh(target.clone()),
            target,
            config,
            workdir: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    fn handle(&self) -> Option<ProcessHandle> {
        self.process.lock().ok().and_then(|process| process.clone())
    }

    fn staged_workdir(&self) -> Option<String> {
        self.workdir.lock().ok().and_then(|dir| dir.clone())
    }

    fn option_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
        ];
        if self.target.port != DEFAULT_SSH_PORT {
            args.push(port_flag.to_string());
            args.push(self.target.port.to_string());
        }
        if let Some(key) = &self.target.key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = self.option_args("-p");
        args.push(self.target.destination());
        args.push(remote_command.to_string());
        args
    }

    fn scp_args(&self, local: &str, remote_path: &str) -> Vec<String> {
        let mut args = self.option_args("-P");
        args.push(local.to_string());
        args.push(scp_destination(&self.target, remote_path));
        args
    }

    fn check_key(&self) -> Result<(), TransportError> {
        match &self.target.key_file {
            Some(key) if !key.is_file() => Err(TransportError::new(
                TransportErrorKind::AuthFailed,
                self.role,
                format!("key file {} does not exist", key.display()),
            )),
            _ => Ok(()),
        }
    }

    fn remote_call(&self, program: &str, args: Vec<String>, what: &'static str) -> RemoteCall {
        RemoteCall {
            role: self.role,
            host: self.target.host.clone(),
            program: program.to_string(),
            args,
            what,
        }
    }

    async fn run_remote(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
        what: &'static str,
    ) -> Result<(), TransportError> {
        self.remote_call(program, args.to_vec(), what).run(cancel).await
    }

    /// The PID-file terminate for a staged POSIX role, if there is one.
    fn remote_stop(&self) -> Option<RemoteCall> {
        let command = self
            .staged_workdir()
            .and_then(|dir| remote_stop_command(&dir, self.target.is_windows()))?;
        Some(self.remote_call(&self.config.ssh_program, self.ssh_args(&command), "remote stop"))
    }
}

/// One `ssh`/`scp` invocation, owned so it can run from a spawned task.
struct RemoteCall {
    role: Role,
    host: String,
    program: String,
    args: Vec<String>,
    what: &'static str,
}

impl RemoteCall {
    async fn run(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::select! {
            output = cmd.output() => output.map_err(|err| {
                TransportError::start_failed(self.role, format!("failed to run {}: {}", self.program, err))
            })?,
            _ = cancel.cancelled() => {
                return Err(TransportError::start_failed(self.role, format!("{} cancelled", self.what)));
            }
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_string)
            .collect();
        let code = output.status.code();
        if let Some(err) = classify_ssh_exit(self.role, code, &stderr) {
            return Err(err);
        }
        let detail = last_line(&stderr).unwrap_or_default();
        match classify_stderr(&stderr) {
            Some(kind) => Err(TransportError::new(kind, self.role, detail)),
            None => Err(TransportError::start_failed(
                self.role,
                format!(
                    "{} on {} failed with status {}: {}",
                    self.what,
                    self.host,
                    code.map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    detail
                ),
            )),
        }
    }

    /// Runs the remote terminate, bounded by `limit`; failures are logged.
    async fn terminate(&self, limit: Duration) {
        let never = CancellationToken::new();
        match tokio::time::timeout(limit, self.run(&never)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(role = %self.role, error = %err, "remote terminate failed"),
            Err(_) => tracing::warn!(role = %self.role, "remote terminate timed out"),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> &TransportKind {
        &self.kind
    }

    async fn stage(
        &self,
        request: &StageRequest,
        cancel: &CancellationToken,
    ) -> Result<StagedRole, TransportError> {
        self.check_key()?;
        let windows = self.target.is_windows();
        let dir = remote_workdir(&request.run_id, self.role, windows);
        self.run_remote(
            &self.config.ssh_program,
            &self.ssh_args(&remote_stage_command(&dir, windows)),
            cancel,
            "remote stage",
        )
        .await?;

        let mut profile_path = request.profile.as_ref().map(|p| p.path.clone());
        if let Some(profile) = &request.profile {
            if profile.distribution == ProfileDistribution::Push {
                let local = Path::new(&profile.path);
                let file_name = match local.file_name() {
                    Some(name) if local.is_file() => name.to_string_lossy().to_string(),
                    _ => {
                        return Err(TransportError::start_failed(
                            self.role,
                            format!("profile {} is not a readable file", profile.path),
                        ))
                    }
                };
                let remote_path = format!(
                    "{}/{}",
                    remote_workdir(&request.run_id, self.role, false),
                    file_name
                );
                self.run_remote(
                    &self.config.scp_program,
                    &self.scp_args(&profile.path, &remote_path),
                    cancel,
                    "profile push",
                )
                .await?;
                profile_path = Some(file_name);
            }
        }

        tracing::info!(role = %self.role, host = %self.target.host, workdir = %dir, "staged remote role");
        if let Ok(mut workdir) = self.workdir.lock() {
            *workdir = Some(dir.clone());
        }
        Ok(StagedRole {
            role: self.role,
            workdir: Some(dir),
            profile_path,
        })
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        launch: &RoleLaunch,
    ) -> Result<RoleProcess, TransportError> {
        self.check_key()?;
        let windows = self.target.is_windows();
        let remote = remote_launch_command(launch, windows);
        let mut cmd = Command::new(&self.config.ssh_program);
        cmd.args(self.ssh_args(&remote))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|err| {
            TransportError::start_failed(
                self.role,
                format!("failed to spawn {}: {}", self.config.ssh_program, err),
            )
        })?;
        let supervised = supervise(
            child,
            SupervisorConfig {
                role: self.role,
                cancel_grace: self.config.stop_grace,
                // Without a PID file the only way to reach the remote process is
                // to drop the session.
                terminate_on_stop: windows,
                classify: Some(classify_ssh_exit),
            },
            cancel.clone(),
        );
        tracing::info!(
            role = %self.role,
            host = %self.target.host,
            command = %launch.command_line(),
            "started remote role"
        );
        // Killing the local client does not reliably reach a remote process
        // started without a tty, so cancellation also terminates it by PID.
        if let Some(remote_stop) = self.remote_stop() {
            let handle = supervised.handle.clone();
            let cancel = cancel.clone();
            let limit = self.config.connect_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = handle.exited() => {}
                    _ = cancel.cancelled() => {
                        tracing::debug!(role = %remote_stop.role, "cancelled; terminating remote role");
                        remote_stop.terminate(limit).await;
                    }
                }
            });
        }
        if let Ok(mut process) = self.process.lock() {
            *process = Some(supervised.handle);
        }
        Ok(RoleProcess {
            events: supervised.events,
            done: supervised.done,
        })
    }

    async fn stop(&self, grace: Duration) {
        let Some(handle) = self.handle() else {
            return;
        };
        let Some(remote_stop) = self.remote_stop() else {
            handle.stop(grace).await;
            return;
        };
        // Registered before the remote kill so the exit it causes counts as a stop.
        let budget = self.config.connect_timeout + grace;
        if !handle.request_stop(budget) {
            return;
        }
        remote_stop.terminate(self.config.connect_timeout).await;
        handle.wait_gone(budget + IO_CAPTURE_TIMEOUT).await;
    }

    fn is_alive(&self) -> bool {
        self.handle().map(|h| h.is_alive()).unwrap_or(false)
    }
}

pub fn remote_workdir(run_id: &str, role: Role, windows: bool) -> String {
    let dir = format!("{}/{}/{}", REMOTE_RUNS_DIR, run_id, role);
    if windows {
        dir.replace('/', "\\")
    } else {
        dir
    }
}

fn remote_stage_command(dir: &str, windows: bool) -> String {
    if windows {
        format!("cmd /c if not exist \"{0}\" mkdir \"{0}\"", dir)
    } else {
        format!("mkdir -p {}", shell_quote(dir))
    }
}

fn remote_launch_command(launch: &RoleLaunch, windows: bool) -> String {
    if windows {
        let mut parts = vec!["cmd /c".to_string()];
        if let Some(dir) = &launch.workdir {
            parts.push(format!("cd /d \"{}\" &&", dir));
        }
        for (key, value) in &launch.env {
            parts.push(format!("set \"{}={}\" &&", key, value));
        }
        parts.extend(launch.argv().iter().map(|arg| windows_quote(arg)));
        return parts.join(" ");
    }
    let mut parts = Vec::new();
    if let Some(dir) = &launch.workdir {
        parts.push(format!("cd {} &&", shell_quote(dir)));
        parts.push(format!("echo $$ > {} &&", REMOTE_PID_FILE));
    }
    parts.push("exec env".to_string());
    for (key, value) in &launch.env {
        parts.push(shell_quote(&format!("{}={}", key, value)));
    }
    parts.extend(launch.argv().iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn remote_stop_command(dir: &str, windows: bool) -> Option<String> {
    if windows {
        return None;
    }
    let pid_file = shell_quote(&format!("{}/{}", dir, REMOTE_PID_FILE));
    Some(format!(
        "if [ -f {0} ]; then kill -TERM \"$(cat {0})\"; fi",
        pid_file
    ))
}

fn windows_quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        arg.to_string()
    } else {
        format!("\"{}\"", arg.replace('"', "\\\""))
    }
}

fn scp_destination(target: &SshTarget, path: &str) -> String {
    let host = if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    };
    match &target.user {
        Some(user) => format!("{}@{}:{}", user, host, path),
        None => format!("{}:{}", host, path),
    }
}

fn last_line(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
}

fn classify_stderr(stderr: &[String]) -> Option<TransportErrorKind> {
    let text = stderr.join("\n").to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));
    if matches(HOST_KEY_PATTERNS) {
        Some(TransportErrorKind::HostKeyUntrusted)
    } else if matches(AUTH_PATTERNS) {
        Some(TransportErrorKind::AuthFailed)
    } else if matches(UNREACHABLE_PATTERNS) {
        Some(TransportErrorKind::Unreachable)
    } else {
        None
    }
}

/// Status 255 is the ssh client failing, not the remote command.
pub(crate) fn classify_ssh_exit(
    role: Role,
    code: Option<i32>,
    stderr: &[String],
) -> Option<TransportError> {
    if code != Some(SSH_CLIENT_FAILURE) {
        return None;
    }
    let kind = classify_stderr(stderr).unwrap_or(TransportErrorKind::Unreachable);
    let message = last_line(stderr)
        .unwrap_or_else(|| format!("ssh exited with status {}", SSH_CLIENT_FAILURE));
    Some(TransportError::new(kind, role, message))
}
