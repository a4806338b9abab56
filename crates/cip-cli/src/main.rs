use anyhow::{anyhow, Context, Result};
use cip_bundle::{Bundle, FileStatus, VerifyOptions};
use cip_core::Role;
use cip_manifest::{extract_agent_mappings, AgentStatus, BundleFormat, Manifest, ManifestError};
use cip_runner::{
    Controller, ControllerError, ControllerOptions, MuxEvent, PhaseUpdate, RunResult, RunStatus,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit status of a cancelled run, as for a shell job stopped by SIGINT.
const EXIT_CANCELLED: i32 = 130;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "ciplab", version = "0.3.0", about = "CIP test harness controller")]
struct Cli {
    /// Debug logging, including every role output line.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    #[value(name = "dir")]
    Dir,
    #[value(name = "tar.gz")]
    TarGz,
    #[value(name = "zip")]
    Zip,
}

impl From<FormatArg> for BundleFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Dir => BundleFormat::Dir,
            FormatArg::TarGz => BundleFormat::TarGz,
            FormatArg::Zip => BundleFormat::Zip,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    #[value(name = "server")]
    Server,
    #[value(name = "client")]
    Client,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Server => Role::Server,
            RoleArg::Client => Role::Client,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a manifest and seal its bundle.
    Run {
        manifest: PathBuf,
        /// Stage every role and write the bundle without starting anything.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        bundle_dir: Option<PathBuf>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
        /// Deadline for the whole run.
        #[arg(long)]
        timeout_seconds: Option<u64>,
        /// Override a role's agent, e.g. `server=ssh://ops@plc-lab`.
        #[arg(long = "agent", value_name = "ROLE=AGENT")]
        agents: Vec<String>,
        /// Role executable (default `cipdip`, or CIPLAB_ROLE_BIN).
        #[arg(long)]
        executable: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Check a manifest without running it.
    Validate {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show which agent runs which role.
    Agents {
        manifest: PathBuf,
        #[arg(long = "agent", value_name = "ROLE=AGENT")]
        agents: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Recompute a bundle's checksums.
    Verify {
        bundle: PathBuf,
        /// Skip files with this extension; repeatable.
        #[arg(long = "skip-ext")]
        skip_ext: Vec<String>,
        #[arg(long)]
        max_file_bytes: Option<u64>,
        /// Only check these role directories; repeatable.
        #[arg(long = "role", value_enum)]
        roles: Vec<RoleArg>,
        #[arg(long)]
        json: bool,
    },
    /// Write a sample manifest.
    Init {
        #[arg(default_value = "ciplab.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Run { .. } => "run",
            Commands::Validate { .. } => "validate",
            Commands::Agents { .. } => "agents",
            Commands::Verify { .. } => "verify",
            Commands::Init { .. } => "init",
        }
    }

    fn json_mode(&self) -> bool {
        match self {
            Commands::Run { json, .. }
            | Commands::Validate { json, .. }
            | Commands::Agents { json, .. }
            | Commands::Verify { json, .. }
            | Commands::Init { json, .. } => *json,
        }
    }
}

struct Outcome {
    payload: Option<Value>,
    exit_code: i32,
}

impl Outcome {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let command_name = cli.command.name();
    let json_mode = cli.command.json_mode();
    match run_command(cli.command, cli.verbose) {
        Ok(outcome) => {
            if let Some(payload) = &outcome.payload {
                emit_json(payload);
            }
            if outcome.exit_code != 0 {
                std::process::exit(outcome.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                let (code, details) = classify_error(&err);
                emit_json(&json_error(command_name, code, format!("{:#}", err), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(command: Commands, verbose: bool) -> Result<Outcome> {
    match command {
        Commands::Run {
            manifest,
            dry_run,
            bundle_dir,
            format,
            timeout_seconds,
            agents,
            executable,
            json,
        } => {
            let mut options = ControllerOptions::from_env()?;
            options.dry_run = dry_run;
            options.verbose = verbose;
            options.agents = parse_agent_overrides(&agents)?;
            if let Some(dir) = bundle_dir {
                options.bundle_dir = dir;
            }
            if let Some(format) = format {
                options.bundle_format = Some(format.into());
            }
            if let Some(secs) = timeout_seconds {
                if secs == 0 {
                    return Err(anyhow!("--timeout-seconds must be positive"));
                }
                options.timeout = Some(Duration::from_secs(secs));
            }
            if let Some(executable) = executable {
                options.executable = executable;
            }
            let manifest = Manifest::load(&manifest)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(execute_run(manifest, options, json))
        }
        Commands::Validate { manifest, json } => {
            let loaded = Manifest::load_validated(&manifest)?;
            let mappings = extract_agent_mappings(&loaded, &BTreeMap::new());
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "manifest": manifest.display().to_string(),
                    "run_id": loaded.run_id,
                    "roles": loaded.present_roles(),
                    "agents": mappings,
                    "readiness": {
                        "method": loaded.readiness.method.as_str(),
                        "timeout_seconds": loaded.readiness.timeout_seconds,
                    },
                    "bundle_format": loaded.artifacts.bundle_format.as_str(),
                }))));
            }
            println!("manifest ok: {}", manifest.display());
            println!("run_id: {}", loaded.run_id);
            for mapping in &mappings {
                println!("{}: {}", mapping.role, mapping.transport);
            }
            Ok(Outcome::done(None))
        }
        Commands::Agents {
            manifest,
            agents,
            json,
        } => {
            let loaded = Manifest::load(&manifest)?;
            let overrides = parse_agent_overrides(&agents)?;
            let mappings = extract_agent_mappings(&loaded, &overrides);
            let all_ok = mappings.iter().all(|m| m.status != AgentStatus::Error);
            let exit_code = if all_ok { 0 } else { 1 };
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": all_ok,
                        "command": "agents",
                        "agents": mappings,
                    })),
                    exit_code,
                });
            }
            for mapping in &mappings {
                match &mapping.detail {
                    Some(detail) => println!("{:<7} {} ({})", mapping.role, mapping.transport, detail),
                    None => println!("{:<7} {}", mapping.role, mapping.transport),
                }
            }
            Ok(Outcome {
                payload: None,
                exit_code,
            })
        }
        Commands::Verify {
            bundle,
            skip_ext,
            max_file_bytes,
            roles,
            json,
        } => {
            let options = VerifyOptions {
                max_file_bytes,
                skip_extensions: skip_ext,
                roles: (!roles.is_empty()).then(|| roles.into_iter().map(Role::from).collect()),
            };
            let opened = Bundle::open(&bundle)?;
            let result = opened.verify(&options)?;
            let intact = result.is_intact();
            let exit_code = if intact { 0 } else { 1 };
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": intact,
                        "command": "verify",
                        "bundle": bundle.display().to_string(),
                        "run_id": result.run_id,
                        "counts": {
                            "matched": result.matched().len(),
                            "mismatched": result.mismatched().len(),
                            "missing": result.missing().len(),
                            "skipped": result.skipped().len(),
                            "extra": result.extra.len(),
                        },
                        "files": result.files,
                        "extra": result.extra,
                    })),
                    exit_code,
                });
            }
            for file in &result.files {
                let label = match file.status {
                    FileStatus::Match => continue,
                    FileStatus::Mismatch => "MISMATCH",
                    FileStatus::Missing => "MISSING",
                    FileStatus::Skipped => "skipped",
                };
                match &file.detail {
                    Some(detail) => println!("{:<8} {} ({})", label, file.path, detail),
                    None => println!("{:<8} {}", label, file.path),
                }
            }
            for extra in &result.extra {
                println!("{:<8} {}", "extra", extra);
            }
            println!(
                "{}: {} ({} matched, {} mismatched, {} missing, {} skipped)",
                result.run_id,
                if intact { "intact" } else { "CORRUPT" },
                result.matched().len(),
                result.mismatched().len(),
                result.missing().len(),
                result.skipped().len()
            );
            Ok(Outcome {
                payload: None,
                exit_code,
            })
        }
        Commands::Init { path, force, json } => {
            init_manifest(&path, force)?;
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "init",
                    "path": path.display().to_string(),
                }))));
            }
            println!("wrote {}", path.display());
            Ok(Outcome::done(None))
        }
    }
}

async fn execute_run(manifest: Manifest, options: ControllerOptions, json: bool) -> Result<Outcome> {
    let mut controller = Controller::new(manifest, options)?;

    let (phase_tx, mut phase_rx) = mpsc::unbounded_channel::<PhaseUpdate>();
    controller.add_observer(std::sync::Arc::new(phase_tx));

    let printer = if json {
        None
    } else {
        controller.take_output().map(|mut output| {
            tokio::spawn(async move {
                while let Some(event) = output.recv().await {
                    match event {
                        MuxEvent::Line(line) => println!("[{}] {}", line.role, line.line),
                        MuxEvent::Stats(snapshot) => {
                            for (role, stats) in &snapshot.roles {
                                tracing::debug!(
                                    role = %role,
                                    requests = stats.requests,
                                    errors = stats.errors,
                                    "stats"
                                );
                            }
                        }
                    }
                }
            })
        })
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        if interrupt.is_cancelled() {
            eprintln!("second interrupt; exiting");
            std::process::exit(EXIT_CANCELLED);
        }
        eprintln!("interrupt received; cancelling run (press Ctrl-C again to force exit)");
        interrupt.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let result = controller.run(cancel).await;
    controller.close().await;
    let result = result?;

    if let Some(printer) = printer {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, printer).await.is_err() {
            tracing::warn!("role output still streaming after the run; dropping the rest");
        }
    }
    let mut phases = Vec::new();
    while let Ok(update) = phase_rx.try_recv() {
        phases.push(update);
    }

    let exit_code = match result.status {
        RunStatus::Success => 0,
        RunStatus::Failed => 1,
        RunStatus::Cancelled => EXIT_CANCELLED,
    };
    if json {
        return Ok(Outcome {
            payload: Some(run_payload(&result, &phases)?),
            exit_code,
        });
    }
    print_run_result(&result);
    Ok(Outcome {
        payload: None,
        exit_code,
    })
}

fn run_payload(result: &RunResult, phases: &[PhaseUpdate]) -> Result<Value> {
    Ok(json!({
        "ok": result.status == RunStatus::Success,
        "command": "run",
        "run": serde_json::to_value(result)?,
        "phases": phases
            .iter()
            .map(|update| json!({
                "phase": update.phase.as_str(),
                "message": update.message,
                "at": update.at.to_rfc3339(),
            }))
            .collect::<Vec<_>>(),
    }))
}

fn print_run_result(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!("status: {}", result.status.as_str());
    for (role, code) in &result.per_role_exit_code {
        match code {
            Some(code) => println!("{} exit: {}", role, code),
            None => println!("{} exit: none", role),
        }
    }
    if let Some(error) = &result.error {
        println!("error: {}", error);
    }
    if let Some(path) = &result.bundle_path {
        println!("bundle: {}", path.display());
    }
    if let Some(path) = &result.archive_path {
        println!("archive: {}", path.display());
    }
    if let Some(err) = &result.bundle_error {
        println!("bundle_error: {}", err);
    }
}

fn init_manifest(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    Manifest::template().save_yaml(path)?;
    Ok(())
}

/// Parses repeated `role=agent` flags. The agent string itself is parsed later,
/// together with the manifest's own agents.
fn parse_agent_overrides(values: &[String]) -> Result<BTreeMap<Role, String>> {
    let mut overrides = BTreeMap::new();
    for raw in values {
        let (role, agent) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --agent '{}' (expected role=agent)", raw))?;
        let role: Role = role.parse()?;
        let agent = agent.trim();
        if agent.is_empty() {
            return Err(anyhow!("invalid --agent '{}': agent is empty", raw));
        }
        if overrides.insert(role, agent.to_string()).is_some() {
            return Err(anyhow!("--agent given twice for role {}", role));
        }
    }
    Ok(overrides)
}

fn classify_error(err: &anyhow::Error) -> (&'static str, Value) {
    let manifest_error = err.downcast_ref::<ManifestError>().or_else(|| {
        match err.downcast_ref::<ControllerError>() {
            Some(ControllerError::Manifest(inner)) => Some(inner),
            _ => None,
        }
    });
    if let Some(ManifestError::Validation { field, .. }) = manifest_error {
        return ("invalid_manifest", json!({ "field": field }));
    }
    if manifest_error.is_some() {
        return ("manifest_error", json!({}));
    }
    if let Some(ControllerError::Transport(inner)) = err.downcast_ref::<ControllerError>() {
        return (
            "transport_error",
            json!({ "kind": inner.kind.as_str(), "role": inner.role.as_str() }),
        );
    }
    if err.downcast_ref::<cip_bundle::BundleError>().is_some() {
        return ("bundle_error", json!({}));
    }
    ("command_failed", json!({}))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(command: &str, code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "command": command,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
