//! Run bundles: per-role artifacts plus a run summary, sealed by a checksum manifest.
//!
//! Layout under `<bundle_dir>/<run_id>/`:
//!
//! ```text
//! summary.json          run summary
//! manifest.yaml         resolved run manifest
//! checksums.json        sha256 of every other file
//! server/ client/       command.txt stdout.log resolved.yaml summary.json metrics.json
//! ```

use chrono::Utc;
use cip_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, Role};
use cip_manifest::BundleFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod archive;
mod verify;

pub use verify::{Bundle, FileStatus, FileVerification, VerifyOptions, VerifyResult};

pub const CHECKSUMS_FILE: &str = "checksums.json";
pub const RUN_SUMMARY_FILE: &str = "summary.json";
pub const RESOLVED_MANIFEST_FILE: &str = "manifest.yaml";
pub const CHECKSUMS_SCHEMA_VERSION: &str = "bundle_checksums_v1";

pub const COMMAND_FILE: &str = "command.txt";
pub const STDOUT_LOG_FILE: &str = "stdout.log";
pub const RESOLVED_ROLE_FILE: &str = "resolved.yaml";
pub const ROLE_SUMMARY_FILE: &str = "summary.json";
pub const ROLE_METRICS_FILE: &str = "metrics.json";

/// Files written for every role, in write order.
pub const ROLE_FILES: [&str; 5] = [
    COMMAND_FILE,
    STDOUT_LOG_FILE,
    RESOLVED_ROLE_FILE,
    ROLE_SUMMARY_FILE,
    ROLE_METRICS_FILE,
];

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bundle {} has no {}", .0.display(), CHECKSUMS_FILE)]
    MissingChecksums(PathBuf),
    #[error("not a bundle directory or archive: {}", .0.display())]
    Unsupported(PathBuf),
    #[error("invalid checksum manifest: {0}")]
    InvalidChecksums(#[from] serde_json::Error),
    #[error("checksum entry '{0}' is not a path inside the bundle")]
    UnsafeEntry(String),
    #[error("archive error in {}: {message}", .path.display())]
    Archive { path: PathBuf, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BundleError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        BundleError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn archive(path: &Path, err: impl std::fmt::Display) -> Self {
        BundleError::Archive {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumManifest {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub algorithm: String,
    /// Keyed by `/`-separated path relative to the bundle root.
    pub files: BTreeMap<String, FileDigest>,
}

/// Everything persisted for one role.
#[derive(Debug, Clone)]
pub struct RoleArtifacts {
    pub role: Role,
    pub command: String,
    pub stdout_log: String,
    pub resolved_yaml: String,
    pub summary: Value,
    pub metrics: Value,
}

pub struct BuildRequest<'a> {
    pub run_id: &'a str,
    pub roles: &'a [RoleArtifacts],
    pub summary: &'a Value,
    pub manifest_yaml: Option<&'a str>,
    pub format: BundleFormat,
}

#[derive(Debug, Clone)]
pub struct BuiltBundle {
    pub path: PathBuf,
    pub archive_path: Option<PathBuf>,
    pub checksums: ChecksumManifest,
}

struct BundleWriter<'a> {
    root: &'a Path,
    files: BTreeMap<String, FileDigest>,
}

impl<'a> BundleWriter<'a> {
    fn write(&mut self, relative: &str, bytes: &[u8]) -> Result<(), BundleError> {
        atomic_write_bytes(&self.root.join(relative), bytes)?;
        self.files.insert(
            relative.to_string(),
            FileDigest {
                sha256: sha256_bytes(bytes),
                size: bytes.len() as u64,
            },
        );
        Ok(())
    }

    fn write_json(&mut self, relative: &str, value: &Value) -> Result<(), BundleError> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        self.write(relative, &bytes)
    }
}

/// Writes the bundle under `run_dir` and seals it with `checksums.json`.
/// Archive formats additionally pack the finished tree next to `run_dir`.
pub fn build(run_dir: &Path, request: BuildRequest<'_>) -> Result<BuiltBundle, BundleError> {
    ensure_dir(run_dir)?;
    let mut writer = BundleWriter {
        root: run_dir,
        files: BTreeMap::new(),
    };

    for artifacts in request.roles {
        let role = artifacts.role.as_str();
        writer.write(
            &format!("{}/{}", role, COMMAND_FILE),
            with_trailing_newline(&artifacts.command).as_bytes(),
        )?;
        writer.write(
            &format!("{}/{}", role, STDOUT_LOG_FILE),
            artifacts.stdout_log.as_bytes(),
        )?;
        writer.write(
            &format!("{}/{}", role, RESOLVED_ROLE_FILE),
            artifacts.resolved_yaml.as_bytes(),
        )?;
        writer.write_json(&format!("{}/{}", role, ROLE_SUMMARY_FILE), &artifacts.summary)?;
        writer.write_json(&format!("{}/{}", role, ROLE_METRICS_FILE), &artifacts.metrics)?;
    }

    if let Some(manifest_yaml) = request.manifest_yaml {
        writer.write(RESOLVED_MANIFEST_FILE, manifest_yaml.as_bytes())?;
    }
    writer.write_json(RUN_SUMMARY_FILE, request.summary)?;

    let checksums = ChecksumManifest {
        schema_version: CHECKSUMS_SCHEMA_VERSION.to_string(),
        run_id: request.run_id.to_string(),
        created_at: Utc::now().to_rfc3339(),
        algorithm: "sha256".to_string(),
        files: writer.files,
    };
    atomic_write_json_pretty(
        &run_dir.join(CHECKSUMS_FILE),
        &serde_json::to_value(&checksums)?,
    )?;
    tracing::debug!(
        run_id = request.run_id,
        files = checksums.files.len(),
        path = %run_dir.display(),
        "bundle directory sealed"
    );

    let archive_path = match request.format.archive_extension() {
        None => None,
        Some(ext) => {
            let archive_path = archive_path_for(run_dir, ext);
            archive::pack(run_dir, &archive_path, request.format)?;
            Some(archive_path)
        }
    };

    Ok(BuiltBundle {
        path: run_dir.to_path_buf(),
        archive_path,
        checksums,
    })
}

fn archive_path_for(run_dir: &Path, ext: &str) -> PathBuf {
    let name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "bundle".to_string());
    run_dir.with_file_name(format!("{}.{}", name, ext))
}

fn with_trailing_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    pub(crate) use cip_core::test_support::TempDirGuard;

    pub(crate) fn sample_roles() -> Vec<RoleArtifacts> {
        vec![
            RoleArtifacts {
                role: Role::Server,
                command: "cipdip server --listen-ip 0.0.0.0".to_string(),
                stdout_log: "2026-03-01T00:00:00Z [stdout] READY\n".to_string(),
                resolved_yaml: "role: server\n".to_string(),
                summary: json!({"role": "server", "exit_code": 0}),
                metrics: json!({"requests": 0, "errors": 0}),
            },
            RoleArtifacts {
                role: Role::Client,
                command: "cipdip client --ip 127.0.0.1".to_string(),
                stdout_log: "2026-03-01T00:00:01Z [stdout] STATS requests=10 errors=0\n"
                    .to_string(),
                resolved_yaml: "role: client\n".to_string(),
                summary: json!({"role": "client", "exit_code": 0}),
                metrics: json!({"requests": 10, "errors": 0}),
            },
        ]
    }

    pub(crate) fn build_sample(root: &Path, format: BundleFormat) -> BuiltBundle {
        let roles = sample_roles();
        let summary = json!({"run_id": "run_test", "status": "success", "dry_run": false});
        build(
            &root.join("runs").join("run_test"),
            BuildRequest {
                run_id: "run_test",
                roles: &roles,
                summary: &summary,
                manifest_yaml: Some("api_version: v1\nrun_id: run_test\n"),
                format,
            },
        )
        .expect("bundle should build")
    }

    #[test]
    fn build_writes_role_files_and_checksums() {
        let root = TempDirGuard::new("cip_bundle_build");
        let built = build_sample(&root.path, BundleFormat::Dir);
        assert!(built.archive_path.is_none());

        for role in ["server", "client"] {
            let mut names: Vec<String> = fs::read_dir(built.path.join(role))
                .expect("role dir")
                .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            let mut expected: Vec<String> = ROLE_FILES.iter().map(|s| s.to_string()).collect();
            expected.sort();
            assert_eq!(names, expected, "role {} holds exactly the artifact files", role);
        }

        assert_eq!(built.checksums.files.len(), 12);
        assert!(built.checksums.files.contains_key("server/stdout.log"));
        assert!(built.checksums.files.contains_key(RUN_SUMMARY_FILE));
        assert!(!built.checksums.files.contains_key(CHECKSUMS_FILE));

        let on_disk: ChecksumManifest = serde_json::from_slice(
            &fs::read(built.path.join(CHECKSUMS_FILE)).expect("checksums file"),
        )
        .expect("checksums parse");
        assert_eq!(on_disk, built.checksums);
        assert_eq!(
            fs::read_to_string(built.path.join("client/command.txt")).expect("command"),
            "cipdip client --ip 127.0.0.1\n"
        );
    }

    #[test]
    fn archive_formats_pack_next_to_the_directory() {
        let root = TempDirGuard::new("cip_bundle_archive");
        let tgz = build_sample(&root.path, BundleFormat::TarGz);
        let archive = tgz.archive_path.expect("tar.gz archive");
        assert_eq!(
            archive.file_name().and_then(|n| n.to_str()),
            Some("run_test.tar.gz")
        );
        assert!(archive.is_file());
        assert!(tgz.path.is_dir(), "directory form is kept");

        let zipped = build_sample(&root.path, BundleFormat::Zip);
        let archive = zipped.archive_path.expect("zip archive");
        assert_eq!(archive.extension().and_then(|e| e.to_str()), Some("zip"));
        assert!(archive.is_file());
    }

    #[test]
    fn existing_archive_is_never_overwritten() {
        let root = TempDirGuard::new("cip_bundle_archive_exists");
        let runs = root.path.join("runs");
        fs::create_dir_all(&runs).expect("runs dir");
        let stale = runs.join("run_test.zip");
        fs::write(&stale, b"earlier run").expect("stale archive");

        let roles = sample_roles();
        let summary = json!({"run_id": "run_test", "status": "success"});
        let err = build(
            &runs.join("run_test"),
            BuildRequest {
                run_id: "run_test",
                roles: &roles,
                summary: &summary,
                manifest_yaml: None,
                format: BundleFormat::Zip,
            },
        )
        .expect_err("archive path is taken");
        assert!(matches!(err, BundleError::Io { ref path, .. } if path == &stale));
        assert_eq!(fs::read(&stale).expect("stale archive"), b"earlier run");
    }
}
