use anyhow::{anyhow, Result};
use cip_core::Role;
use cip_manifest::BundleFormat;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUNDLE_DIR: &str = "runs";
pub const DEFAULT_ROLE_BIN: &str = "cipdip";
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";
pub const DEFAULT_SCP_PROGRAM: &str = "scp";

pub const ENV_BUNDLE_DIR: &str = "CIPLAB_BUNDLE_DIR";
pub const ENV_ROLE_BIN: &str = "CIPLAB_ROLE_BIN";
pub const ENV_SSH: &str = "CIPLAB_SSH";
pub const ENV_SCP: &str = "CIPLAB_SCP";
pub const ENV_STOP_GRACE_MS: &str = "CIPLAB_STOP_GRACE_MS";
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "CIPLAB_CONNECT_TIMEOUT_SECS";
pub const ENV_STATS_INTERVAL_MS: &str = "CIPLAB_STATS_INTERVAL_MS";

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub bundle_dir: PathBuf,
    /// Overrides `artifacts.bundle_format` from the manifest.
    pub bundle_format: Option<BundleFormat>,
    /// Deadline for the whole run.
    pub timeout: Option<Duration>,
    pub dry_run: bool,
    /// Log every role output line at debug level.
    pub verbose: bool,
    /// Transport descriptor overrides, applied over the manifest's agents.
    pub agents: BTreeMap<Role, String>,
    pub executable: String,
    pub ssh_program: String,
    pub scp_program: String,
    pub stop_grace: Duration,
    pub connect_timeout: Duration,
    pub stats_interval: Duration,
    pub collect_grace: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from(DEFAULT_BUNDLE_DIR),
            bundle_format: None,
            timeout: None,
            dry_run: false,
            verbose: false,
            agents: BTreeMap::new(),
            executable: DEFAULT_ROLE_BIN.to_string(),
            ssh_program: DEFAULT_SSH_PROGRAM.to_string(),
            scp_program: DEFAULT_SCP_PROGRAM.to_string(),
            stop_grace: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            stats_interval: Duration::from_secs(1),
            collect_grace: Duration::from_secs(5),
        }
    }
}

impl ControllerOptions {
    /// Defaults layered with `CIPLAB_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(dir) = non_empty_env(ENV_BUNDLE_DIR) {
            options.bundle_dir = PathBuf::from(dir);
        }
        if let Some(bin) = non_empty_env(ENV_ROLE_BIN) {
            options.executable = bin;
        }
        if let Some(ssh) = non_empty_env(ENV_SSH) {
            options.ssh_program = ssh;
        }
        if let Some(scp) = non_empty_env(ENV_SCP) {
            options.scp_program = scp;
        }
        if let Some(ms) = parse_optional_positive_u64_env(ENV_STOP_GRACE_MS)? {
            options.stop_grace = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_optional_positive_u64_env(ENV_CONNECT_TIMEOUT_SECS)? {
            options.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_optional_positive_u64_env(ENV_STATS_INTERVAL_MS)? {
            options.stats_interval = Duration::from_millis(ms);
        }
        Ok(options)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = ControllerOptions::default();
        assert_eq!(options.bundle_dir, PathBuf::from("runs"));
        assert_eq!(options.executable, "cipdip");
        assert_eq!(options.stop_grace, Duration::from_secs(5));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.stats_interval, Duration::from_secs(1));
        assert!(options.bundle_format.is_none());
        assert!(!options.dry_run);
    }

    #[test]
    fn positive_env_values_parse_and_reject_zero() {
        let name = "CIPLAB_TEST_POSITIVE_U64_ENV";
        env::remove_var(name);
        assert_eq!(parse_optional_positive_u64_env(name).expect("unset"), None);
        env::set_var(name, " 250 ");
        assert_eq!(parse_optional_positive_u64_env(name).expect("set"), Some(250));
        env::set_var(name, "0");
        assert!(parse_optional_positive_u64_env(name).is_err());
        env::set_var(name, "soon");
        assert!(parse_optional_positive_u64_env(name).is_err());
        env::remove_var(name);
    }
}
