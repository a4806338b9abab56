use crate::archive::{bundle_files, relative_name};
use crate::{BundleError, ChecksumManifest, FileDigest, CHECKSUMS_FILE};
use cip_core::{sha256_reader, Role};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BundleSource {
    Dir(PathBuf),
    TarGz(PathBuf),
    Zip(PathBuf),
}

impl BundleSource {
    fn detect(path: &Path) -> Result<Self, BundleError> {
        if path.is_dir() {
            return Ok(BundleSource::Dir(path.to_path_buf()));
        }
        if !path.exists() {
            return Err(BundleError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "bundle path does not exist"),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(BundleSource::TarGz(path.to_path_buf()))
        } else if name.ends_with(".zip") {
            Ok(BundleSource::Zip(path.to_path_buf()))
        } else {
            Err(BundleError::Unsupported(path.to_path_buf()))
        }
    }

    fn path(&self) -> &Path {
        match self {
            BundleSource::Dir(path) | BundleSource::TarGz(path) | BundleSource::Zip(path) => path,
        }
    }
}

/// Which listed files a verification pass recomputes. The default checks everything.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Files whose recorded size exceeds this are skipped.
    pub max_file_bytes: Option<u64>,
    /// Extensions (without the dot, case-insensitive) to skip, e.g. `pcap`.
    pub skip_extensions: Vec<String>,
    /// Restrict role directories to these roles; top-level files are always checked.
    pub roles: Option<Vec<Role>>,
}

impl VerifyOptions {
    fn skip_reason(&self, name: &str, digest: &FileDigest) -> Option<String> {
        if let Some(limit) = self.max_file_bytes {
            if digest.size > limit {
                return Some(format!("size {} exceeds limit {}", digest.size, limit));
            }
        }
        let lowered = name.to_ascii_lowercase();
        for ext in &self.skip_extensions {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            if !ext.is_empty() && lowered.ends_with(&format!(".{}", ext)) {
                return Some(format!("extension .{} skipped", ext));
            }
        }
        if let Some(roles) = &self.roles {
            if let Some((dir, _)) = name.split_once('/') {
                if let Ok(role) = dir.parse::<Role>() {
                    if !roles.contains(&role) {
                        return Some(format!("role {} not selected", role));
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Match,
    Mismatch,
    Missing,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileVerification {
    pub path: String,
    pub status: FileStatus,
    pub expected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub bundle: PathBuf,
    pub run_id: String,
    pub files: Vec<FileVerification>,
    /// Files present in the bundle but absent from the checksum manifest.
    pub extra: Vec<String>,
}

impl VerifyResult {
    fn with_status(&self, status: FileStatus) -> Vec<&FileVerification> {
        self.files.iter().filter(|f| f.status == status).collect()
    }

    pub fn matched(&self) -> Vec<&FileVerification> {
        self.with_status(FileStatus::Match)
    }

    pub fn mismatched(&self) -> Vec<&FileVerification> {
        self.with_status(FileStatus::Mismatch)
    }

    pub fn missing(&self) -> Vec<&FileVerification> {
        self.with_status(FileStatus::Missing)
    }

    pub fn skipped(&self) -> Vec<&FileVerification> {
        self.with_status(FileStatus::Skipped)
    }

    /// Zero mismatches and zero missing files.
    pub fn is_intact(&self) -> bool {
        self.files
            .iter()
            .all(|f| !matches!(f.status, FileStatus::Mismatch | FileStatus::Missing))
    }
}

/// A previously built bundle; only its checksum manifest is loaded up front.
#[derive(Debug, Clone)]
pub struct Bundle {
    source: BundleSource,
    checksums: ChecksumManifest,
}

impl Bundle {
    pub fn open(path: &Path) -> Result<Self, BundleError> {
        let source = BundleSource::detect(path)?;
        let raw = match &source {
            BundleSource::Dir(root) => {
                let checksums_path = root.join(CHECKSUMS_FILE);
                if !checksums_path.is_file() {
                    return Err(BundleError::MissingChecksums(root.clone()));
                }
                fs::read(&checksums_path).map_err(|err| BundleError::io(&checksums_path, err))?
            }
            BundleSource::TarGz(archive) => read_tar_entry(archive, CHECKSUMS_FILE)?
                .ok_or_else(|| BundleError::MissingChecksums(archive.clone()))?,
            BundleSource::Zip(archive) => read_zip_entry(archive, CHECKSUMS_FILE)?
                .ok_or_else(|| BundleError::MissingChecksums(archive.clone()))?,
        };
        let checksums: ChecksumManifest = serde_json::from_slice(&raw)?;
        if let Some(name) = checksums.files.keys().find(|name| !is_bundle_relative(name)) {
            return Err(BundleError::UnsafeEntry(name.clone()));
        }
        Ok(Self { source, checksums })
    }

    pub fn path(&self) -> &Path {
        self.source.path()
    }

    pub fn run_id(&self) -> &str {
        &self.checksums.run_id
    }

    pub fn checksums(&self) -> &ChecksumManifest {
        &self.checksums
    }

    /// Recomputes the digest of every listed file selected by `options`.
    pub fn verify(&self, options: &VerifyOptions) -> Result<VerifyResult, BundleError> {
        let (observed, extra) = match &self.source {
            BundleSource::Dir(root) => self.observe_dir(root, options)?,
            BundleSource::TarGz(archive) => self.observe_tar(archive, options)?,
            BundleSource::Zip(archive) => self.observe_zip(archive, options)?,
        };

        let mut files = Vec::with_capacity(self.checksums.files.len());
        for (name, expected) in &self.checksums.files {
            let verification = if let Some(reason) = options.skip_reason(name, expected) {
                FileVerification {
                    path: name.clone(),
                    status: FileStatus::Skipped,
                    expected: expected.sha256.clone(),
                    actual: None,
                    detail: Some(reason),
                }
            } else {
                match observed.get(name) {
                    None => FileVerification {
                        path: name.clone(),
                        status: FileStatus::Missing,
                        expected: expected.sha256.clone(),
                        actual: None,
                        detail: None,
                    },
                    Some((digest, size)) => {
                        let intact = *digest == expected.sha256 && *size == expected.size;
                        FileVerification {
                            path: name.clone(),
                            status: if intact {
                                FileStatus::Match
                            } else {
                                FileStatus::Mismatch
                            },
                            expected: expected.sha256.clone(),
                            actual: Some(digest.clone()),
                            detail: if *size != expected.size {
                                Some(format!("size {} != recorded {}", size, expected.size))
                            } else {
                                None
                            },
                        }
                    }
                }
            };
            files.push(verification);
        }

        let result = VerifyResult {
            bundle: self.path().to_path_buf(),
            run_id: self.checksums.run_id.clone(),
            files,
            extra,
        };
        if !result.is_intact() {
            tracing::warn!(
                bundle = %result.bundle.display(),
                mismatched = result.mismatched().len(),
                missing = result.missing().len(),
                "bundle failed verification"
            );
        }
        Ok(result)
    }

    fn wants(&self, name: &str, options: &VerifyOptions) -> bool {
        self.checksums
            .files
            .get(name)
            .map(|digest| options.skip_reason(name, digest).is_none())
            .unwrap_or(false)
    }

    fn observe_dir(
        &self,
        root: &Path,
        options: &VerifyOptions,
    ) -> Result<(BTreeMap<String, (String, u64)>, Vec<String>), BundleError> {
        let mut observed = BTreeMap::new();
        for name in self.checksums.files.keys() {
            if !self.wants(name, options) {
                continue;
            }
            let path = root.join(name);
            if !path.is_file() {
                continue;
            }
            let file = fs::File::open(&path).map_err(|err| BundleError::io(&path, err))?;
            observed.insert(name.clone(), sha256_reader(file)?);
        }
        let extra = bundle_files(root)?
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name != CHECKSUMS_FILE && !self.checksums.files.contains_key(name))
            .collect();
        Ok((observed, extra))
    }

    fn observe_tar(
        &self,
        archive_path: &Path,
        options: &VerifyOptions,
    ) -> Result<(BTreeMap<String, (String, u64)>, Vec<String>), BundleError> {
        let file = fs::File::open(archive_path).map_err(|err| BundleError::io(archive_path, err))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut observed = BTreeMap::new();
        let mut extra = BTreeSet::new();
        let entries = archive
            .entries()
            .map_err(|err| BundleError::archive(archive_path, err))?;
        for entry in entries {
            let mut entry = entry.map_err(|err| BundleError::archive(archive_path, err))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = relative_name(
                &entry
                    .path()
                    .map_err(|err| BundleError::archive(archive_path, err))?,
            );
            if name == CHECKSUMS_FILE {
                continue;
            }
            if !self.checksums.files.contains_key(&name) {
                extra.insert(name);
                continue;
            }
            if self.wants(&name, options) {
                observed.insert(name, sha256_reader(&mut entry)?);
            }
        }
        Ok((observed, extra.into_iter().collect()))
    }

    fn observe_zip(
        &self,
        archive_path: &Path,
        options: &VerifyOptions,
    ) -> Result<(BTreeMap<String, (String, u64)>, Vec<String>), BundleError> {
        let file = fs::File::open(archive_path).map_err(|err| BundleError::io(archive_path, err))?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|err| BundleError::archive(archive_path, err))?;
        let mut observed = BTreeMap::new();
        for name in self.checksums.files.keys() {
            if !self.wants(name, options) {
                continue;
            }
            match archive.by_name(name) {
                Ok(entry) => {
                    observed.insert(name.clone(), sha256_reader(entry)?);
                }
                Err(zip::result::ZipError::FileNotFound) => {}
                Err(err) => return Err(BundleError::archive(archive_path, err)),
            }
        }
        let extra = archive
            .file_names()
            .filter(|name| *name != CHECKSUMS_FILE && !self.checksums.files.contains_key(*name))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok((observed, extra))
    }
}

fn read_tar_entry(archive_path: &Path, wanted: &str) -> Result<Option<Vec<u8>>, BundleError> {
    let file = fs::File::open(archive_path).map_err(|err| BundleError::io(archive_path, err))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|err| BundleError::archive(archive_path, err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| BundleError::archive(archive_path, err))?;
        let name = relative_name(
            &entry
                .path()
                .map_err(|err| BundleError::archive(archive_path, err))?,
        );
        if name == wanted {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|err| BundleError::archive(archive_path, err))?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

fn read_zip_entry(archive_path: &Path, wanted: &str) -> Result<Option<Vec<u8>>, BundleError> {
    let file = fs::File::open(archive_path).map_err(|err| BundleError::io(archive_path, err))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|err| BundleError::archive(archive_path, err))?;
    let result = match archive.by_name(wanted) {
        Ok(mut entry) => {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|err| BundleError::archive(archive_path, err))?;
            Ok(Some(buf))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(BundleError::archive(archive_path, err)),
    };
    result
}

/// `/`-separated names of plain components; nothing that can leave the root.
fn is_bundle_relative(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\\')
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != ".." && !part.contains(':'))
}
