use crate::error::{ControllerError, ReadinessError, RunError, RunErrorKind, TransportError};
use crate::mux::{Multiplexer, OutputEvent, RoleCapture, RunOutput};
use crate::options::ControllerOptions;
use crate::phase::{Phase, PhaseObserver, PhaseUpdate};
use crate::process::{ExitResult, IO_CAPTURE_TIMEOUT};
use crate::readiness::{strategy_for, wait_ready};
use crate::transport::{
    DefaultTransportFactory, RoleLaunch, StageRequest, StagedRole, Transport, TransportFactory,
};
use chrono::{DateTime, Utc};
use cip_bundle::{BuildRequest, RoleArtifacts};
use cip_core::{ensure_dir, Role};
use cip_manifest::{
    extract_agent_mappings, resolve_agents, AgentMapping, BundleFormat, Manifest, TransportKind,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Slack on top of the client's own duration before it is stopped.
pub const CLIENT_BACKSTOP_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub per_role_exit_code: BTreeMap<Role, Option<i32>>,
    /// Bundle directory; `None` only when it could not be created.
    pub bundle_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub error: Option<RunError>,
    /// Bundle failures never change `status`.
    pub bundle_error: Option<String>,
}

#[derive(Debug)]
struct ControllerState {
    phase: Phase,
    ran: bool,
    closed: bool,
}

/// Per-role bookkeeping for one run.
struct RoleRun {
    role: Role,
    transport: Arc<dyn Transport>,
    launch: Option<RoleLaunch>,
    staged: Option<StagedRole>,
    started: bool,
    done: Option<oneshot::Receiver<ExitResult>>,
    exit: Option<ExitResult>,
    capture: Option<JoinHandle<RoleCapture>>,
}

impl RoleRun {
    /// Waits (bounded) for the exit report of a started role.
    async fn settle(&mut self, limit: Duration) -> Option<&ExitResult> {
        if self.exit.is_none() {
            if let Some(done) = self.done.take() {
                let exit = match tokio::time::timeout(limit, done).await {
                    Ok(Ok(exit)) => exit,
                    Ok(Err(_)) => ExitResult::lost("supervisor ended without an exit report"),
                    Err(_) => ExitResult::lost("no exit report before the deadline"),
                };
                self.exit = Some(exit);
            }
        }
        self.exit.as_ref()
    }
}

struct RunContext {
    manifest: Manifest,
    run_dir: PathBuf,
    started_at: DateTime<Utc>,
    roles: BTreeMap<Role, RoleRun>,
}

/// Drives one run of a manifest through its phases and seals the result in a bundle.
pub struct Controller {
    manifest: Manifest,
    options: ControllerOptions,
    agents: BTreeMap<Role, TransportKind>,
    transports: BTreeMap<Role, Arc<dyn Transport>>,
    observers: Vec<Arc<dyn PhaseObserver>>,
    callback: Option<Arc<dyn PhaseObserver>>,
    mux: Mutex<Option<Multiplexer>>,
    output: Mutex<Option<RunOutput>>,
    state: Mutex<ControllerState>,
}

impl Controller {
    pub fn new(manifest: Manifest, options: ControllerOptions) -> Result<Self, ControllerError> {
        Self::with_factory(manifest, options, Arc::new(DefaultTransportFactory))
    }

    /// Validates the manifest and builds one transport per present role. Nothing
    /// is started; every error here is final.
    pub fn with_factory(
        manifest: Manifest,
        options: ControllerOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ControllerError> {
        manifest.validate()?;
        let agents = resolve_agents(&manifest, &options.agents)?;
        let mut transports = BTreeMap::new();
        for (role, kind) in &agents {
            transports.insert(*role, factory.create(*role, kind, &options)?);
        }
        let (mux, output) = Multiplexer::new(options.stats_interval, options.verbose);
        Ok(Self {
            manifest,
            options,
            agents,
            transports,
            observers: Vec::new(),
            callback: None,
            mux: Mutex::new(Some(mux)),
            output: Mutex::new(Some(output)),
            state: Mutex::new(ControllerState {
                phase: Phase::Init,
                ran: false,
                closed: false,
            }),
        })
    }

    pub fn add_observer(&mut self, observer: Arc<dyn PhaseObserver>) {
        self.observers.push(observer);
    }

    /// Replaces the single callback slot; observers added with `add_observer` are kept.
    ///
    /// `collect` and `bundle` are reported on every run that got past `init`.
    /// The terminal `done`, `error` or `cancelled` update always comes last.
    pub fn set_phase_callback<F>(&mut self, callback: F)
    where
        F: Fn(&PhaseUpdate) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    /// The run's merged output and stats lanes. Output nobody claimed before
    /// `run` is discarded.
    pub fn take_output(&self) -> Option<RunOutput> {
        self.output.lock().ok().and_then(|mut output| output.take())
    }

    pub fn agent_mappings(&self) -> Vec<AgentMapping> {
        extract_agent_mappings(&self.manifest, &self.options.agents)
    }

    pub fn agents(&self) -> &BTreeMap<Role, TransportKind> {
        &self.agents
    }

    pub fn phase(&self) -> Phase {
        self.state
            .lock()
            .map(|state| state.phase)
            .unwrap_or(Phase::Error)
    }

    /// Stops any live role process. Further `run` calls fail with `Closed`.
    pub async fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        for (role, transport) in &self.transports {
            if transport.is_alive() {
                tracing::info!(role = %role, "stopping role on close");
                transport.stop(self.options.stop_grace).await;
            }
        }
    }

    fn enter(&self, phase: Phase, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
        }
        let update = PhaseUpdate::new(phase, message);
        match phase {
            Phase::Error => tracing::error!(phase = %phase, "{}", update.message),
            Phase::Cancelled => tracing::warn!(phase = %phase, "{}", update.message),
            _ => tracing::info!(phase = %phase, "{}", update.message),
        }
        for observer in self.observers.iter().chain(self.callback.iter()) {
            observer.on_phase(&update);
        }
    }

    /// Executes the run once. In-run failures are reported on the result, not
    /// as errors, and still produce a best-effort bundle.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunResult, ControllerError> {
        {
            let mut state = self.state.lock().map_err(|_| ControllerError::Closed)?;
            if state.closed {
                return Err(ControllerError::Closed);
            }
            if state.ran {
                return Err(ControllerError::AlreadyRan);
            }
            state.ran = true;
        }
        let Some(mut mux) = self.mux.lock().ok().and_then(|mut mux| mux.take()) else {
            return Err(ControllerError::AlreadyRan);
        };
        drop(self.take_output());

        let run_token = cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline = self.options.timeout.map(|limit| {
            let token = run_token.clone();
            let hit = deadline_hit.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        hit.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            })
        });

        let started_at = Utc::now();
        let manifest = self.manifest.resolve_run_id(started_at);
        let run_id = manifest.run_id.clone();
        self.enter(Phase::Init, format!("run {}", run_id));

        let archive_ext = self.bundle_format().archive_extension();
        let run_dir = match allocate_run_dir(&self.options.bundle_dir, &run_id, archive_ext) {
            Ok(dir) => dir,
            Err(err) => {
                if let Some(task) = deadline {
                    task.abort();
                }
                let error = RunError::new(RunErrorKind::Setup, Phase::Init, None, err.to_string());
                self.enter(Phase::Error, error.to_string());
                return Ok(RunResult {
                    run_id,
                    status: RunStatus::Failed,
                    per_role_exit_code: BTreeMap::new(),
                    bundle_path: None,
                    archive_path: None,
                    error: Some(error),
                    bundle_error: Some(format!("bundle directory unavailable: {}", err)),
                });
            }
        };

        let roles = self
            .transports
            .iter()
            .map(|(role, transport)| {
                (
                    *role,
                    RoleRun {
                        role: *role,
                        transport: transport.clone(),
                        launch: RoleLaunch::for_role(&manifest, *role, &self.options.executable, None),
                        staged: None,
                        started: false,
                        done: None,
                        exit: None,
                        capture: None,
                    },
                )
            })
            .collect();
        let mut ctx = RunContext {
            manifest,
            run_dir,
            started_at,
            roles,
        };

        let mut outcome = self.execute(&mut ctx, &mut mux, &run_token).await;
        if outcome.is_ok() && run_token.is_cancelled() {
            outcome = Err(RunError::cancelled(Phase::ServerStop));
        }
        let mut failure = outcome
            .err()
            .map(|err| self.classify_failure(err, &cancel, &deadline_hit));
        if let Some((status, err)) = &failure {
            tracing::warn!(
                status = status.as_str(),
                phase = %err.phase,
                error = %err,
                "run did not succeed; tearing down"
            );
            self.teardown(&mut ctx).await;
        }

        self.enter(Phase::Collect, "collecting role output");
        let captures = self.collect(&mut ctx).await;
        drop(mux);
        if failure.is_none() && run_token.is_cancelled() {
            failure = Some(self.classify_failure(
                RunError::cancelled(Phase::Collect),
                &cancel,
                &deadline_hit,
            ));
        }
        if let Some(task) = deadline {
            task.abort();
        }
        let (status, error) = match failure {
            Some((status, err)) => (status, Some(err)),
            None => (RunStatus::Success, None),
        };

        self.enter(Phase::Bundle, format!("writing bundle {}", ctx.run_dir.display()));
        let summary = self.run_summary(&ctx, status, error.as_ref(), &captures);
        let (archive_path, bundle_error) = match self.write_bundle(&ctx, &captures, &summary) {
            Ok(archive_path) => (archive_path, None),
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "bundle incomplete");
                (None, Some(err.to_string()))
            }
        };
        match (status, &error) {
            (RunStatus::Cancelled, Some(err)) => self.enter(Phase::Cancelled, err.to_string()),
            (_, Some(err)) => self.enter(Phase::Error, err.to_string()),
            (_, None) => self.enter(Phase::Done, format!("run {} succeeded", run_id)),
        }

        Ok(RunResult {
            run_id,
            status,
            per_role_exit_code: ctx
                .roles
                .iter()
                .filter(|(_, role_run)| role_run.started)
                .map(|(role, role_run)| (*role, role_run.exit.as_ref().and_then(|e| e.code)))
                .collect(),
            bundle_path: Some(ctx.run_dir.clone()),
            archive_path,
            error,
            bundle_error,
        })
    }

    /// Attributes a failure to the caller's cancellation or the run deadline
    /// when either fired.
    fn classify_failure(
        &self,
        err: RunError,
        cancel: &CancellationToken,
        deadline_hit: &AtomicBool,
    ) -> (RunStatus, RunError) {
        if cancel.is_cancelled() {
            (RunStatus::Cancelled, RunError::cancelled(err.phase))
        } else if deadline_hit.load(Ordering::SeqCst) {
            let limit = self.options.timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
            (
                RunStatus::Failed,
                RunError::new(
                    RunErrorKind::DeadlineExceeded,
                    err.phase,
                    err.role,
                    format!("run exceeded its {}s deadline", limit),
                ),
            )
        } else {
            (RunStatus::Failed, err)
        }
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        mux: &mut Multiplexer,
        token: &CancellationToken,
    ) -> Result<(), RunError> {
        let dry_run = self.options.dry_run;

        self.enter(Phase::Stage, "staging roles");
        for role_run in ctx.roles.values_mut() {
            checkpoint(token, Phase::Stage)?;
            let request = StageRequest {
                run_id: ctx.manifest.run_id.clone(),
                role: role_run.role,
                profile: ctx.manifest.profile.clone(),
            };
            let staged = role_run
                .transport
                .stage(&request, token)
                .await
                .map_err(|err| transport_failure(token, Phase::Stage, &err))?;
            role_run.launch = RoleLaunch::for_role(
                &ctx.manifest,
                role_run.role,
                &self.options.executable,
                Some(&staged),
            );
            role_run.staged = Some(staged);
        }

        // Server
        self.enter(Phase::ServerStart, self.role_message(ctx, Role::Server, "starting server"));
        checkpoint(token, Phase::ServerStart)?;
        let mut ready_tap = None;
        if !dry_run {
            if let Some(server) = ctx.roles.get_mut(&Role::Server) {
                let (tap_tx, tap_rx) = mpsc::unbounded_channel();
                self.start_role(server, mux, token, Phase::ServerStart, Some(tap_tx))
                    .await?;
                ready_tap = Some(tap_rx);
            }
        }

        self.enter(Phase::ServerReady, self.role_message(ctx, Role::Server, "waiting for server readiness"));
        if let Some(mut tap) = ready_tap {
            let strategy = strategy_for(&ctx.manifest.readiness);
            let timeout = ctx.manifest.readiness_timeout();
            tracing::debug!(strategy = %strategy.describe(), timeout_s = timeout.as_secs(), "readiness");
            match wait_ready(token, &mut tap, strategy.as_ref(), timeout).await {
                Ok(()) => {}
                Err(ReadinessError::Cancelled) => return Err(RunError::cancelled(Phase::ServerReady)),
                Err(err @ ReadinessError::Timeout(_)) => {
                    return Err(RunError::new(
                        RunErrorKind::ReadinessTimeout,
                        Phase::ServerReady,
                        Some(Role::Server),
                        err.to_string(),
                    ))
                }
                Err(ReadinessError::ServerExited) => {
                    let server = ctx.roles.get_mut(&Role::Server);
                    let exit = match server {
                        Some(server) => server.settle(IO_CAPTURE_TIMEOUT).await.cloned(),
                        None => None,
                    };
                    return Err(server_exited_early(exit));
                }
            }
        }

        // Client
        self.enter(Phase::ClientStart, self.role_message(ctx, Role::Client, "starting client"));
        checkpoint(token, Phase::ClientStart)?;
        if !dry_run {
            if let Some(client) = ctx.roles.get_mut(&Role::Client) {
                self.start_role(client, mux, token, Phase::ClientStart, None)
                    .await?;
            }
        }

        self.enter(Phase::ClientDone, self.role_message(ctx, Role::Client, "waiting for client"));
        let backstop = ctx
            .manifest
            .client_duration()
            .map(|duration| duration + CLIENT_BACKSTOP_SLACK);
        if let Some(client) = ctx.roles.get_mut(&Role::Client).filter(|c| c.started) {
            self.await_client(client, backstop, token).await?;
        }

        // Teardown
        self.enter(Phase::ServerStop, self.role_message(ctx, Role::Server, "stopping server"));
        if let Some(server) = ctx.roles.get_mut(&Role::Server).filter(|s| s.started) {
            server.transport.stop(self.options.stop_grace).await;
            let limit = self.options.stop_grace + IO_CAPTURE_TIMEOUT;
            if let Some(exit) = server.settle(limit).await {
                if !exit.was_requested() && !exit.success() {
                    if let Some(err) = &exit.transport_error {
                        return Err(RunError::transport(Phase::ServerStop, err));
                    }
                    return Err(RunError::new(
                        RunErrorKind::Execution { exit_code: exit.code },
                        Phase::ServerStop,
                        Some(Role::Server),
                        format!("server exited with {} before it was stopped", describe_exit(exit)),
                    ));
                }
            }
        }
        Ok(())
    }

    fn role_message(&self, ctx: &RunContext, role: Role, action: &str) -> String {
        if !ctx.roles.contains_key(&role) {
            format!("no {} role", role)
        } else if self.options.dry_run {
            format!("dry run: {} skipped", action)
        } else {
            action.to_string()
        }
    }

    async fn start_role(
        &self,
        role_run: &mut RoleRun,
        mux: &mut Multiplexer,
        token: &CancellationToken,
        phase: Phase,
        tap: Option<mpsc::UnboundedSender<OutputEvent>>,
    ) -> Result<(), RunError> {
        let Some(launch) = role_run.launch.clone() else {
            return Err(RunError::new(
                RunErrorKind::Setup,
                phase,
                Some(role_run.role),
                "role has no command",
            ));
        };
        let process = role_run
            .transport
            .start(token, &launch)
            .await
            .map_err(|err| transport_failure(token, phase, &err))?;
        role_run.started = true;
        role_run.done = Some(process.done);
        role_run.capture = Some(mux.attach(role_run.role, process.events, tap));
        Ok(())
    }

    async fn await_client(
        &self,
        client: &mut RoleRun,
        backstop: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<(), RunError> {
        enum Waited {
            Exited(Result<ExitResult, oneshot::error::RecvError>),
            Backstop,
            Cancelled,
        }
        let Some(mut done) = client.done.take() else {
            return Ok(());
        };
        let waited = tokio::select! {
            biased;
            _ = token.cancelled() => Waited::Cancelled,
            exit = &mut done => Waited::Exited(exit),
            _ = sleep_or_pending(backstop) => Waited::Backstop,
        };
        let exit = match waited {
            Waited::Cancelled => {
                client.done = Some(done);
                return Err(RunError::cancelled(Phase::ClientDone));
            }
            Waited::Exited(exit) => {
                exit.unwrap_or_else(|_| ExitResult::lost("supervisor ended without an exit report"))
            }
            Waited::Backstop => {
                tracing::warn!(
                    backstop_s = backstop.map(|b| b.as_secs()).unwrap_or_default(),
                    "client outlived its duration; stopping it"
                );
                client.transport.stop(self.options.stop_grace).await;
                client.done = Some(done);
                let limit = self.options.stop_grace + IO_CAPTURE_TIMEOUT;
                // A stop at the backstop is a normal end of the client's run.
                return match client.settle(limit).await {
                    Some(exit) => match &exit.transport_error {
                        Some(err) => Err(RunError::transport(Phase::ClientDone, err)),
                        None => Ok(()),
                    },
                    None => Ok(()),
                };
            }
        };
        client.exit = Some(exit.clone());
        if let Some(err) = &exit.transport_error {
            return Err(RunError::transport(Phase::ClientDone, err));
        }
        if !exit.success() {
            return Err(RunError::new(
                RunErrorKind::Execution { exit_code: exit.code },
                Phase::ClientDone,
                Some(Role::Client),
                format!("client exited with {}", describe_exit(&exit)),
            ));
        }
        Ok(())
    }

    /// Best-effort stop of every role still running after a failure.
    async fn teardown(&self, ctx: &mut RunContext) {
        for role_run in ctx.roles.values_mut() {
            if !role_run.started {
                continue;
            }
            if role_run.transport.is_alive() {
                tracing::info!(role = %role_run.role, "stopping role after failure");
                role_run.transport.stop(self.options.stop_grace).await;
            }
            let limit = self.options.stop_grace + IO_CAPTURE_TIMEOUT;
            role_run.settle(limit).await;
        }
    }

    async fn collect(&self, ctx: &mut RunContext) -> BTreeMap<Role, RoleCapture> {
        let mut captures = BTreeMap::new();
        for role_run in ctx.roles.values_mut() {
            let role = role_run.role;
            let capture = match role_run.capture.take() {
                None => RoleCapture::new(role),
                Some(mut task) => {
                    match tokio::time::timeout(self.options.collect_grace, &mut task).await {
                        Ok(Ok(capture)) => capture,
                        Ok(Err(err)) => {
                            tracing::warn!(role = %role, error = %err, "output capture task failed");
                            RoleCapture::new(role)
                        }
                        Err(_) => {
                            tracing::warn!(role = %role, "output capture did not finish in time");
                            task.abort();
                            RoleCapture::new(role)
                        }
                    }
                }
            };
            captures.insert(role, capture);
        }
        captures
    }

    fn run_summary(
        &self,
        ctx: &RunContext,
        status: RunStatus,
        error: Option<&RunError>,
        captures: &BTreeMap<Role, RoleCapture>,
    ) -> Value {
        let finished_at = Utc::now();
        let roles: serde_json::Map<String, Value> = ctx
            .roles
            .iter()
            .map(|(role, role_run)| {
                (
                    role.as_str().to_string(),
                    role_summary(role_run, self.agents.get(role), captures.get(role)),
                )
            })
            .collect();
        json!({
            "run_id": ctx.manifest.run_id,
            "status": status.as_str(),
            "dry_run": self.options.dry_run,
            "started_at": ctx.started_at.to_rfc3339(),
            "finished_at": finished_at.to_rfc3339(),
            "duration_ms": (finished_at - ctx.started_at).num_milliseconds(),
            "bundle_format": self.bundle_format().as_str(),
            "error": error.map(RunError::to_json),
            "roles": roles,
        })
    }

    fn bundle_format(&self) -> BundleFormat {
        self.options
            .bundle_format
            .unwrap_or(self.manifest.artifacts.bundle_format)
    }

    fn write_bundle(
        &self,
        ctx: &RunContext,
        captures: &BTreeMap<Role, RoleCapture>,
        summary: &Value,
    ) -> Result<Option<PathBuf>, cip_bundle::BundleError> {
        let mut artifacts = Vec::new();
        for (role, role_run) in &ctx.roles {
            let capture = captures.get(role).cloned().unwrap_or_else(|| RoleCapture::new(*role));
            let resolved = json!({
                "role": role.as_str(),
                "run_id": ctx.manifest.run_id,
                "transport": self.agents.get(role).map(|kind| kind.to_string()),
                "command": role_run.launch.as_ref().map(RoleLaunch::argv),
                "env": role_run.launch.as_ref().map(|launch| {
                    launch
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                        .collect::<serde_json::Map<_, _>>()
                }),
                "workdir": role_run.staged.as_ref().and_then(|s| s.workdir.clone()),
                "profile": role_run.staged.as_ref().and_then(|s| s.profile_path.clone()),
                "dry_run": self.options.dry_run,
            });
            let resolved_yaml = serde_yaml::to_string(&resolved)
                .map_err(|err| cip_bundle::BundleError::Other(err.into()))?;
            artifacts.push(RoleArtifacts {
                role: *role,
                command: role_run
                    .launch
                    .as_ref()
                    .map(RoleLaunch::command_line)
                    .unwrap_or_default(),
                stdout_log: capture.log.clone(),
                resolved_yaml,
                summary: role_summary(role_run, self.agents.get(role), Some(&capture)),
                metrics: capture.metrics_json(),
            });
        }
        let manifest_yaml = ctx
            .manifest
            .to_yaml_string()
            .map_err(|err| cip_bundle::BundleError::Other(err.into()))?;
        let built = cip_bundle::build(
            &ctx.run_dir,
            BuildRequest {
                run_id: &ctx.manifest.run_id,
                roles: &artifacts,
                summary,
                manifest_yaml: Some(&manifest_yaml),
                format: self.bundle_format(),
            },
        )?;
        tracing::info!(
            path = %built.path.display(),
            files = built.checksums.files.len(),
            "bundle written"
        );
        Ok(built.archive_path)
    }
}

fn role_summary(
    role_run: &RoleRun,
    kind: Option<&TransportKind>,
    capture: Option<&RoleCapture>,
) -> Value {
    let exit = role_run.exit.as_ref();
    json!({
        "role": role_run.role.as_str(),
        "transport": kind.map(|kind| kind.to_string()),
        "staged": role_run.staged.is_some(),
        "started": role_run.started,
        "exit_code": exit.and_then(|e| e.code),
        "termination": exit.map(|e| e.termination.as_str()),
        "exit_error": exit.and_then(|e| e.error.clone()),
        "transport_error": exit.and_then(|e| e.transport_error.as_ref()).map(|e| e.kind.as_str()),
        "stderr_tail": exit.map(|e| e.stderr_tail.clone()).unwrap_or_default(),
        "lines": capture.map(RoleCapture::lines).unwrap_or_default(),
    })
}

fn checkpoint(token: &CancellationToken, phase: Phase) -> Result<(), RunError> {
    if token.is_cancelled() {
        Err(RunError::cancelled(phase))
    } else {
        Ok(())
    }
}

fn transport_failure(token: &CancellationToken, phase: Phase, err: &TransportError) -> RunError {
    if token.is_cancelled() {
        RunError::cancelled(phase)
    } else {
        RunError::transport(phase, err)
    }
}

fn server_exited_early(exit: Option<ExitResult>) -> RunError {
    match exit {
        Some(ExitResult {
            transport_error: Some(err),
            ..
        }) => RunError::transport(Phase::ServerReady, &err),
        Some(exit) => RunError::new(
            RunErrorKind::ReadinessFailed,
            Phase::ServerReady,
            Some(Role::Server),
            format!("server exited with {} before reporting ready", describe_exit(&exit)),
        ),
        None => RunError::new(
            RunErrorKind::ReadinessFailed,
            Phase::ServerReady,
            Some(Role::Server),
            "server output closed before it reported ready",
        ),
    }
}

fn describe_exit(exit: &ExitResult) -> String {
    match (exit.code, &exit.error) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(error)) => error.clone(),
        (None, None) => format!("no exit code ({})", exit.termination.as_str()),
    }
}

async fn sleep_or_pending(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Claims `bundle_dir/run_id`, or `run_id_N` when that directory or its
/// sibling archive already exists.
fn allocate_run_dir(
    bundle_dir: &Path,
    run_id: &str,
    archive_ext: Option<&str>,
) -> anyhow::Result<PathBuf> {
    ensure_dir(bundle_dir)?;
    for attempt in 0u32..1000 {
        let name = if attempt == 0 {
            run_id.to_string()
        } else {
            format!("{}_{}", run_id, attempt)
        };
        if let Some(ext) = archive_ext {
            if bundle_dir.join(format!("{}.{}", name, ext)).exists() {
                continue;
            }
        }
        let candidate = bundle_dir.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "failed to create {}: {}",
                    candidate.display(),
                    err
                ))
            }
        }
    }
    Err(anyhow::anyhow!(
        "no free bundle directory for {} under {}",
        run_id,
        bundle_dir.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use crate::transport::RoleProcess;
    use crate::test_support::TempDirGuard;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Calls {
        staged: AtomicUsize,
        started: AtomicUsize,
    }

    struct CountingTransport {
        role: Role,
        kind: TransportKind,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> &TransportKind {
            &self.kind
        }

        async fn stage(
            &self,
            _request: &StageRequest,
            _cancel: &CancellationToken,
        ) -> Result<StagedRole, TransportError> {
            self.calls.staged.fetch_add(1, Ordering::SeqCst);
            Ok(StagedRole {
                role: self.role,
                workdir: None,
                profile_path: None,
            })
        }

        async fn start(
            &self,
            _cancel: &CancellationToken,
            _launch: &RoleLaunch,
        ) -> Result<RoleProcess, TransportError> {
            self.calls.started.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::start_failed(self.role, "not expected"))
        }

        async fn stop(&self, _grace: Duration) {}

        fn is_alive(&self) -> bool {
            false
        }
    }

    struct CountingFactory(Arc<Calls>);

    impl TransportFactory for CountingFactory {
        fn create(
            &self,
            role: Role,
            kind: &TransportKind,
            _options: &ControllerOptions,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            Ok(Arc::new(CountingTransport {
                role,
                kind: kind.clone(),
                calls: self.0.clone(),
            }))
        }
    }

    fn options(root: &TempDirGuard) -> ControllerOptions {
        ControllerOptions {
            bundle_dir: root.path.join("runs"),
            stop_grace: Duration::from_secs(3),
            stats_interval: Duration::from_millis(50),
            ..ControllerOptions::default()
        }
    }

    fn record_phases(controller: &mut Controller) -> Arc<Mutex<Vec<Phase>>> {
        let phases = Arc::new(Mutex::new(Vec::new()));
        let sink = phases.clone();
        controller.set_phase_callback(move |update: &PhaseUpdate| {
            sink.lock().expect("phases").push(update.phase);
        });
        phases
    }

    fn read_json(path: &Path) -> Value {
        let raw = fs::read_to_string(path).expect("read json");
        serde_json::from_str(&raw).expect("parse json")
    }

    #[tokio::test]
    async fn dry_run_walks_every_phase_without_starting_roles() {
        let root = TempDirGuard::new("cip_ctrl_dry");
        let calls = Arc::new(Calls::default());
        let mut manifest = Manifest::template();
        manifest.run_id = "dry_01".to_string();
        let mut controller = Controller::with_factory(
            manifest,
            ControllerOptions {
                dry_run: true,
                ..options(&root)
            },
            Arc::new(CountingFactory(calls.clone())),
        )
        .expect("controller");
        let phases = record_phases(&mut controller);

        let result = controller.run(CancellationToken::new()).await.expect("run");
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.run_id, "dry_01");
        assert!(result.error.is_none());
        assert!(result.per_role_exit_code.is_empty());
        assert_eq!(calls.staged.load(Ordering::SeqCst), 2);
        assert_eq!(calls.started.load(Ordering::SeqCst), 0);
        assert_eq!(*phases.lock().expect("phases"), Phase::SEQUENCE.to_vec());
        assert_eq!(controller.phase(), Phase::Done);

        let bundle = result.bundle_path.expect("bundle path");
        assert_eq!(bundle, root.path.join("runs").join("dry_01"));
        let summary = read_json(&bundle.join(cip_bundle::RUN_SUMMARY_FILE));
        assert_eq!(summary["dry_run"], true);
        assert_eq!(summary["status"], "success");
        assert!(bundle.join("server").join(cip_bundle::COMMAND_FILE).is_file());
    }

    #[tokio::test]
    async fn run_ids_never_reuse_an_existing_bundle_directory() {
        let root = TempDirGuard::new("cip_ctrl_collide");
        let mut manifest = Manifest::template();
        manifest.run_id = "nightly".to_string();
        fs::create_dir_all(root.path.join("runs").join("nightly")).expect("existing run");

        let controller = Controller::with_factory(
            manifest,
            ControllerOptions {
                dry_run: true,
                ..options(&root)
            },
            Arc::new(CountingFactory(Arc::new(Calls::default()))),
        )
        .expect("controller");
        let result = controller.run(CancellationToken::new()).await.expect("run");
        assert_eq!(
            result.bundle_path,
            Some(root.path.join("runs").join("nightly_1"))
        );
    }

    #[tokio::test]
    async fn run_ids_skip_names_whose_archive_already_exists() {
        let root = TempDirGuard::new("cip_ctrl_collide_archive");
        let runs = root.path.join("runs");
        fs::create_dir_all(&runs).expect("runs dir");
        fs::write(runs.join("nightly.tar.gz"), b"earlier run").expect("stale archive");
        let mut manifest = Manifest::template();
        manifest.run_id = "nightly".to_string();

        let controller = Controller::with_factory(
            manifest,
            ControllerOptions {
                dry_run: true,
                bundle_format: Some(BundleFormat::TarGz),
                ..options(&root)
            },
            Arc::new(CountingFactory(Arc::new(Calls::default()))),
        )
        .expect("controller");
        let result = controller.run(CancellationToken::new()).await.expect("run");
        assert!(result.bundle_error.is_none(), "{:?}", result.bundle_error);
        assert_eq!(result.bundle_path, Some(runs.join("nightly_1")));
        assert_eq!(result.archive_path, Some(runs.join("nightly_1.tar.gz")));
        assert_eq!(fs::read(runs.join("nightly.tar.gz")).expect("stale"), b"earlier run");
    }

    #[tokio::test]
    async fn second_run_and_run_after_close_are_rejected() {
        let root = TempDirGuard::new("cip_ctrl_once");
        let factory = Arc::new(CountingFactory(Arc::new(Calls::default())));
        let opts = ControllerOptions {
            dry_run: true,
            ..options(&root)
        };

        let controller =
            Controller::with_factory(Manifest::template(), opts.clone(), factory.clone())
                .expect("controller");
        controller.run(CancellationToken::new()).await.expect("first run");
        assert!(matches!(
            controller.run(CancellationToken::new()).await,
            Err(ControllerError::AlreadyRan)
        ));

        let controller =
            Controller::with_factory(Manifest::template(), opts, factory).expect("controller");
        controller.close().await;
        assert!(matches!(
            controller.run(CancellationToken::new()).await,
            Err(ControllerError::Closed)
        ));
    }

    #[test]
    fn invalid_manifest_is_rejected_before_anything_runs() {
        let mut manifest = Manifest::template();
        manifest.readiness.timeout_seconds = 0;
        match Controller::new(manifest, ControllerOptions::default()) {
            Err(ControllerError::Manifest(err)) => assert!(err.is_validation()),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("invalid manifest accepted"),
        }

        let mut options = ControllerOptions::default();
        options.agents.insert(Role::Client, "telnet://plc".to_string());
        assert!(matches!(
            Controller::new(Manifest::template(), options),
            Err(ControllerError::Manifest(_))
        ));
    }

    #[cfg(unix)]
    mod local_roles {
        use super::*;
        use crate::test_support::write_script;
        use crate::mux::MuxEvent;

        const SERVER_AND_CLIENT: &str = r#"case "$1" in
  server)
    trap 'echo "server stopping"; exit 0' TERM
    echo "listening on $3"
    echo READY
    while true; do sleep 0.1; done
    ;;
  client)
    echo "STATS requests=12 errors=1 rtt_ms=3.5"
    echo "client finished"
    exit 0
    ;;
esac
exit 64
"#;

        fn local_options(root: &TempDirGuard, body: &str) -> ControllerOptions {
            ControllerOptions {
                executable: write_script(&root.path, "cipdip", body),
                ..options(root)
            }
        }

        #[tokio::test]
        async fn local_server_and_client_run_to_success() {
            let root = TempDirGuard::new("cip_ctrl_local");
            let mut controller = Controller::new(
                Manifest::template(),
                local_options(&root, SERVER_AND_CLIENT),
            )
            .expect("controller");
            let phases = record_phases(&mut controller);
            let mut output = controller.take_output().expect("output");
            let lines = tokio::spawn(async move {
                let mut lines = Vec::new();
                while let Some(event) = output.recv().await {
                    if let MuxEvent::Line(event) = event {
                        lines.push((event.role, event.line));
                    }
                }
                lines
            });

            let result = controller.run(CancellationToken::new()).await.expect("run");
            assert_eq!(result.status, RunStatus::Success, "{:?}", result.error);
            assert!(result.run_id.starts_with("run_"));
            assert_eq!(result.per_role_exit_code.get(&Role::Server), Some(&Some(0)));
            assert_eq!(result.per_role_exit_code.get(&Role::Client), Some(&Some(0)));
            assert!(result.archive_path.is_none());
            assert_eq!(*phases.lock().expect("phases"), Phase::SEQUENCE.to_vec());

            let lines = lines.await.expect("consumer");
            assert!(lines.contains(&(Role::Server, "READY".to_string())));
            assert!(lines.contains(&(Role::Client, "client finished".to_string())));

            let bundle = result.bundle_path.expect("bundle");
            for role in ["server", "client"] {
                for file in [
                    cip_bundle::COMMAND_FILE,
                    cip_bundle::STDOUT_LOG_FILE,
                    cip_bundle::RESOLVED_ROLE_FILE,
                    cip_bundle::ROLE_SUMMARY_FILE,
                    cip_bundle::ROLE_METRICS_FILE,
                ] {
                    assert!(bundle.join(role).join(file).is_file(), "{}/{}", role, file);
                }
            }
            let server_log =
                fs::read_to_string(bundle.join("server").join(cip_bundle::STDOUT_LOG_FILE))
                    .expect("server log");
            assert!(server_log.contains("[stdout] READY"));
            assert!(server_log.contains("server stopping"));
            let metrics = read_json(&bundle.join("client").join(cip_bundle::ROLE_METRICS_FILE));
            assert_eq!(metrics["requests"], 12);
            assert_eq!(metrics["errors"], 1);
            let server_summary =
                read_json(&bundle.join("server").join(cip_bundle::ROLE_SUMMARY_FILE));
            assert_eq!(server_summary["termination"], "stopped");

            let verified = cip_bundle::Bundle::open(&bundle)
                .expect("open bundle")
                .verify(&cip_bundle::VerifyOptions::default())
                .expect("verify");
            assert!(verified.is_intact());
        }

        #[tokio::test]
        async fn cancellation_at_client_start_tears_down_the_server() {
            let root = TempDirGuard::new("cip_ctrl_cancel");
            let mut controller = Controller::new(
                Manifest::template(),
                local_options(&root, SERVER_AND_CLIENT),
            )
            .expect("controller");
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let phases = Arc::new(Mutex::new(Vec::new()));
            let sink = phases.clone();
            controller.set_phase_callback(move |update: &PhaseUpdate| {
                sink.lock().expect("phases").push(update.phase);
                if update.phase == Phase::ClientStart {
                    trigger.cancel();
                }
            });

            let started = std::time::Instant::now();
            let result = controller.run(cancel).await.expect("run");
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(result.status, RunStatus::Cancelled);
            let error = result.error.expect("error");
            assert_eq!(error.kind, RunErrorKind::Cancelled);
            assert_eq!(error.phase, Phase::ClientStart);
            assert!(!result.per_role_exit_code.contains_key(&Role::Client));
            assert_eq!(phases.lock().expect("phases").last(), Some(&Phase::Cancelled));

            let bundle = result.bundle_path.expect("bundle");
            let server_log =
                fs::read_to_string(bundle.join("server").join(cip_bundle::STDOUT_LOG_FILE))
                    .expect("server log");
            assert!(server_log.contains("READY"));
            let summary = read_json(&bundle.join(cip_bundle::RUN_SUMMARY_FILE));
            assert_eq!(summary["status"], "cancelled");
            assert_eq!(summary["error"]["kind"], "cancelled");
        }

        #[tokio::test]
        async fn silent_server_times_out_waiting_for_readiness() {
            let root = TempDirGuard::new("cip_ctrl_ready_timeout");
            let mut manifest = Manifest::template();
            manifest.readiness.timeout_seconds = 1;
            let mut controller = Controller::new(
                manifest,
                local_options(&root, "echo warming up\nexec sleep 30\n"),
            )
            .expect("controller");
            let phases = record_phases(&mut controller);

            let result = controller.run(CancellationToken::new()).await.expect("run");
            assert_eq!(result.status, RunStatus::Failed);
            let error = result.error.expect("error");
            assert_eq!(error.kind, RunErrorKind::ReadinessTimeout);
            assert_eq!(error.role, Some(Role::Server));
            assert!(result.per_role_exit_code.contains_key(&Role::Server));
            assert!(!result.per_role_exit_code.contains_key(&Role::Client));
            assert_eq!(controller.phase(), Phase::Error);
            assert!(phases.lock().expect("phases").ends_with(&[
                Phase::ServerReady,
                Phase::Collect,
                Phase::Bundle,
                Phase::Error,
            ]));
            assert!(result.bundle_path.expect("bundle").join(cip_bundle::CHECKSUMS_FILE).is_file());
        }

        #[tokio::test]
        async fn cancellation_while_stopping_the_server_is_not_a_success() {
            let root = TempDirGuard::new("cip_ctrl_cancel_stop");
            let mut controller = Controller::new(
                Manifest::template(),
                local_options(&root, SERVER_AND_CLIENT),
            )
            .expect("controller");
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let phases = Arc::new(Mutex::new(Vec::new()));
            let sink = phases.clone();
            controller.set_phase_callback(move |update: &PhaseUpdate| {
                sink.lock().expect("phases").push(update.phase);
                if update.phase == Phase::ServerStop {
                    trigger.cancel();
                }
            });

            let result = controller.run(cancel).await.expect("run");
            assert_eq!(result.status, RunStatus::Cancelled);
            let error = result.error.expect("error");
            assert_eq!(error.kind, RunErrorKind::Cancelled);
            assert_eq!(error.phase, Phase::ServerStop);
            assert_eq!(result.per_role_exit_code.get(&Role::Client), Some(&Some(0)));
            assert!(phases.lock().expect("phases").ends_with(&[
                Phase::ServerStop,
                Phase::Collect,
                Phase::Bundle,
                Phase::Cancelled,
            ]));
            assert_eq!(controller.phase(), Phase::Cancelled);

            let bundle = result.bundle_path.expect("bundle");
            let summary = read_json(&bundle.join(cip_bundle::RUN_SUMMARY_FILE));
            assert_eq!(summary["status"], "cancelled");
            assert_eq!(summary["error"]["phase"], "server_stop");
        }

        #[tokio::test]
        async fn server_exiting_before_ready_fails_readiness() {
            let root = TempDirGuard::new("cip_ctrl_ready_exit");
            let controller = Controller::new(
                Manifest::template(),
                local_options(&root, "echo 'bind failed' >&2\nexit 2\n"),
            )
            .expect("controller");

            let result = controller.run(CancellationToken::new()).await.expect("run");
            assert_eq!(result.status, RunStatus::Failed);
            let error = result.error.expect("error");
            assert_eq!(error.kind, RunErrorKind::ReadinessFailed);
            assert!(error.message.contains("code 2"));
            assert_eq!(result.per_role_exit_code.get(&Role::Server), Some(&Some(2)));
        }

        #[tokio::test]
        async fn run_deadline_stops_a_hanging_client() {
            let root = TempDirGuard::new("cip_ctrl_deadline");
            let body = SERVER_AND_CLIENT.replace(
                "echo \"STATS requests=12 errors=1 rtt_ms=3.5\"",
                "exec sleep 10",
            );
            let controller = Controller::new(
                Manifest::template(),
                ControllerOptions {
                    timeout: Some(Duration::from_secs(1)),
                    ..local_options(&root, &body)
                },
            )
            .expect("controller");

            let started = std::time::Instant::now();
            let result = controller.run(CancellationToken::new()).await.expect("run");
            assert!(started.elapsed() < Duration::from_secs(9));
            assert_eq!(result.status, RunStatus::Failed);
            let error = result.error.expect("error");
            assert_eq!(error.kind, RunErrorKind::DeadlineExceeded);
            assert!(result.bundle_path.expect("bundle").join(cip_bundle::CHECKSUMS_FILE).is_file());
        }

        #[tokio::test]
        async fn unreachable_ssh_agent_fails_stage_with_a_bundle() {
            let root = TempDirGuard::new("cip_ctrl_ssh");
            let ssh = write_script(
                &root.path,
                "ssh",
                "echo 'ssh: connect to host 10.9.9.9 port 22: No route to host' >&2\nexit 255\n",
            );
            let mut opts = local_options(&root, SERVER_AND_CLIENT);
            opts.ssh_program = ssh;
            opts.agents
                .insert(Role::Server, "ssh://lab@10.9.9.9".to_string());
            let controller = Controller::new(Manifest::template(), opts).expect("controller");

            let result = controller.run(CancellationToken::new()).await.expect("run");
            assert_eq!(result.status, RunStatus::Failed);
            let error = result.error.expect("error");
            assert_eq!(
                error.kind,
                RunErrorKind::Transport(TransportErrorKind::Unreachable)
            );
            assert_eq!(error.phase, Phase::Stage);
            assert_eq!(error.role, Some(Role::Server));
            assert!(result.per_role_exit_code.is_empty());

            let bundle = result.bundle_path.expect("bundle");
            let summary = read_json(&bundle.join(cip_bundle::RUN_SUMMARY_FILE));
            assert_eq!(summary["error"]["transport_error"], "unreachable");
            assert_eq!(summary["roles"]["server"]["transport"], "ssh://lab@10.9.9.9");
        }
    }
}
