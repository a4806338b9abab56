use chrono::{DateTime, Utc};
use cip_core::{atomic_write_bytes, timestamp_run_id, Role, RUN_ID_PLACEHOLDER};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod agent;
mod mapping;

pub use agent::{
    RemoteOs, SshTarget, TransportKind, TransportParseError, DEFAULT_SSH_PORT, LOCAL_AGENT,
};
pub use mapping::{extract_agent_mappings, resolve_agents, AgentMapping, AgentStatus};

pub const API_VERSION: &str = "v1";
pub const DEFAULT_READY_MARKER: &str = "READY";
/// Registered EtherNet/IP explicit messaging port.
pub const DEFAULT_TARGET_PORT: u16 = 44818;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid manifest: {field}: {message}")]
    Validation { field: String, message: String },
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("failed to write manifest {}: {message}", .path.display())]
    Write { path: PathBuf, message: String },
}

impl ManifestError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ManifestError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ManifestError::Validation { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub roles: Roles,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default)]
    pub artifacts: Artifacts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub path: String,
    #[serde(default)]
    pub distribution: ProfileDistribution,
}

/// How the profile document reaches a role's agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileDistribution {
    /// Passed as-is; the agent is expected to see the same path.
    #[default]
    Inline,
    /// Copied into the staged working directory of every remote role.
    Push,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Network {
    #[serde(default)]
    pub data_plane: DataPlane,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataPlane {
    #[serde(default = "default_listen_ip")]
    pub server_listen_ip: String,
    #[serde(default)]
    pub target_ip: String,
    #[serde(default = "default_target_port")]
    pub target_port: u16,
}

impl Default for DataPlane {
    fn default() -> Self {
        Self {
            server_listen_ip: default_listen_ip(),
            target_ip: String::new(),
            target_port: DEFAULT_TARGET_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Roles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientRole>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerRole {
    pub agent: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub personality: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientRole {
    pub agent: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub duration_seconds: i64,
    #[serde(default)]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMethod {
    /// Marker line on the server's stdout.
    #[default]
    StructuredStdout,
    /// Marker line on either stdout or stderr.
    LogMarker,
    /// Ready as soon as the server process is running.
    None,
}

impl ReadinessMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessMethod::StructuredStdout => "structured_stdout",
            ReadinessMethod::LogMarker => "log_marker",
            ReadinessMethod::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Readiness {
    #[serde(default)]
    pub method: ReadinessMethod,
    #[serde(default = "default_readiness_timeout")]
    pub timeout_seconds: i64,
    #[serde(default = "default_ready_marker")]
    pub marker: String,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            method: ReadinessMethod::default(),
            timeout_seconds: default_readiness_timeout(),
            marker: default_ready_marker(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleFormat {
    #[default]
    #[serde(rename = "dir")]
    Dir,
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "zip")]
    Zip,
}

impl BundleFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            BundleFormat::Dir => "dir",
            BundleFormat::TarGz => "tar.gz",
            BundleFormat::Zip => "zip",
        }
    }

    pub fn archive_extension(self) -> Option<&'static str> {
        match self {
            BundleFormat::Dir => None,
            BundleFormat::TarGz => Some("tar.gz"),
            BundleFormat::Zip => Some("zip"),
        }
    }
}

impl fmt::Display for BundleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BundleFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "dir" => Ok(BundleFormat::Dir),
            "tar.gz" | "tgz" => Ok(BundleFormat::TarGz),
            "zip" => Ok(BundleFormat::Zip),
            other => Err(format!(
                "unsupported bundle format '{}' (expected dir, tar.gz or zip)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifacts {
    #[serde(default)]
    pub bundle_format: BundleFormat,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_target_port() -> u16 {
    DEFAULT_TARGET_PORT
}

fn default_readiness_timeout() -> i64 {
    30
}

fn default_ready_marker() -> String {
    DEFAULT_READY_MARKER.to_string()
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_validated(path: &Path) -> Result<Self, ManifestError> {
        let manifest = Self::load(path)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_yaml_string(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save_yaml(&self, path: &Path) -> Result<(), ManifestError> {
        let raw = self.to_yaml_string()?;
        atomic_write_bytes(path, raw.as_bytes()).map_err(|err| ManifestError::Write {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Checks the manifest invariants in a fixed order and reports the first violation.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.api_version != API_VERSION {
            return Err(ManifestError::validation(
                "api_version",
                format!(
                    "unsupported api_version '{}' (expected '{}')",
                    self.api_version, API_VERSION
                ),
            ));
        }
        if self.run_id.trim().is_empty() {
            return Err(ManifestError::validation(
                "run_id",
                format!("must not be empty (use '{}' to generate one)", RUN_ID_PLACEHOLDER),
            ));
        }
        if !is_single_component(self.run_id.trim()) {
            return Err(ManifestError::validation(
                "run_id",
                format!(
                    "'{}' must be a single directory name (no path separators or '..')",
                    self.run_id.trim()
                ),
            ));
        }
        if self.roles.server.is_none() && self.roles.client.is_none() {
            return Err(ManifestError::validation(
                "roles",
                "at least one of roles.server or roles.client is required",
            ));
        }
        if let Some(server) = &self.roles.server {
            TransportKind::parse(&server.agent).map_err(|err| {
                ManifestError::validation("roles.server.agent", err.to_string())
            })?;
        }
        if let Some(client) = &self.roles.client {
            TransportKind::parse(&client.agent).map_err(|err| {
                ManifestError::validation("roles.client.agent", err.to_string())
            })?;
        }
        if self.readiness.timeout_seconds <= 0 {
            return Err(ManifestError::validation(
                "readiness.timeout_seconds",
                format!("must be > 0 (got {})", self.readiness.timeout_seconds),
            ));
        }
        if self.readiness.method != ReadinessMethod::None && self.readiness.marker.trim().is_empty()
        {
            return Err(ManifestError::validation(
                "readiness.marker",
                format!(
                    "must not be empty for method '{}'",
                    self.readiness.method.as_str()
                ),
            ));
        }
        if let Some(client) = &self.roles.client {
            if client.duration_seconds < 0 {
                return Err(ManifestError::validation(
                    "roles.client.duration_seconds",
                    format!("must be >= 0 (got {})", client.duration_seconds),
                ));
            }
            if self.network.data_plane.target_ip.trim().is_empty() {
                return Err(ManifestError::validation(
                    "network.data_plane.target_ip",
                    "required when a client role is present",
                ));
            }
            if self.network.data_plane.target_port == 0 {
                return Err(ManifestError::validation(
                    "network.data_plane.target_port",
                    "must be > 0",
                ));
            }
        }
        if let Some(profile) = &self.profile {
            if profile.path.trim().is_empty() {
                return Err(ManifestError::validation("profile.path", "must not be empty"));
            }
        }
        Ok(())
    }

    pub fn has_placeholder_run_id(&self) -> bool {
        self.run_id.trim() == RUN_ID_PLACEHOLDER
    }

    /// Returns a copy whose placeholder run ID is replaced with one derived from `now`.
    pub fn resolve_run_id(&self, now: DateTime<Utc>) -> Manifest {
        let mut resolved = self.clone();
        if self.has_placeholder_run_id() {
            resolved.run_id = timestamp_run_id(now);
        } else {
            resolved.run_id = self.run_id.trim().to_string();
        }
        resolved
    }

    pub fn present_roles(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| self.role_agent(*role).is_some())
            .collect()
    }

    pub fn role_agent(&self, role: Role) -> Option<&str> {
        match role {
            Role::Server => self.roles.server.as_ref().map(|s| s.agent.as_str()),
            Role::Client => self.roles.client.as_ref().map(|c| c.agent.as_str()),
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.timeout_seconds.max(0) as u64)
    }

    /// `None` when the client has no fixed duration and is expected to exit on its own.
    pub fn client_duration(&self) -> Option<Duration> {
        self.roles
            .client
            .as_ref()
            .filter(|client| client.duration_seconds > 0)
            .map(|client| Duration::from_secs(client.duration_seconds as u64))
    }

    /// Sample manifest written by `ciplab init`.
    pub fn template() -> Manifest {
        Manifest {
            api_version: API_VERSION.to_string(),
            run_id: RUN_ID_PLACEHOLDER.to_string(),
            profile: None,
            network: Network {
                data_plane: DataPlane {
                    server_listen_ip: "0.0.0.0".to_string(),
                    target_ip: "127.0.0.1".to_string(),
                    target_port: DEFAULT_TARGET_PORT,
                },
            },
            roles: Roles {
                server: Some(ServerRole {
                    agent: LOCAL_AGENT.to_string(),
                    mode: "emulator".to_string(),
                    personality: "adapter".to_string(),
                }),
                client: Some(ClientRole {
                    agent: LOCAL_AGENT.to_string(),
                    scenario: "baseline".to_string(),
                    duration_seconds: 30,
                    interval_ms: 250,
                }),
            },
            readiness: Readiness::default(),
            artifacts: Artifacts::default(),
        }
    }
}

/// Run ids name the local bundle directory and the remote working directory.
fn is_single_component(id: &str) -> bool {
    use std::path::Component;
    if id.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
