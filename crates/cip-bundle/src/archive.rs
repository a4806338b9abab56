use crate::BundleError;
use cip_manifest::BundleFormat;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::FileOptions;

/// Packs every file under `run_dir` into `out_path`; entry names are relative to `run_dir`.
pub(crate) fn pack(run_dir: &Path, out_path: &Path, format: BundleFormat) -> Result<(), BundleError> {
    let files = bundle_files(run_dir)?;
    match format {
        BundleFormat::Dir => Ok(()),
        BundleFormat::TarGz => pack_tar_gz(run_dir, &files, out_path),
        BundleFormat::Zip => pack_zip(run_dir, &files, out_path),
    }
}

/// Sorted `(relative name, absolute path)` pairs for every regular file in the tree.
pub(crate) fn bundle_files(run_dir: &Path) -> Result<Vec<(String, PathBuf)>, BundleError> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(run_dir).sort_by_file_name() {
        let entry = entry.map_err(|err| BundleError::archive(run_dir, err))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(run_dir) else {
            continue;
        };
        files.push((relative_name(relative), path.to_path_buf()));
    }
    Ok(files)
}

pub(crate) fn relative_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Archives are never overwritten; an existing file at `out_path` is an error.
fn create_archive(out_path: &Path) -> Result<fs::File, BundleError> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(out_path)
        .map_err(|err| BundleError::io(out_path, err))
}

fn pack_tar_gz(
    run_dir: &Path,
    files: &[(String, PathBuf)],
    out_path: &Path,
) -> Result<(), BundleError> {
    let file = create_archive(out_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, path) in files {
        builder
            .append_path_with_name(path, name)
            .map_err(|err| BundleError::io(path, err))?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|err| BundleError::archive(run_dir, err))?;
    let mut file = encoder
        .finish()
        .map_err(|err| BundleError::archive(out_path, err))?;
    file.flush().map_err(|err| BundleError::io(out_path, err))?;
    Ok(())
}

fn pack_zip(run_dir: &Path, files: &[(String, PathBuf)], out_path: &Path) -> Result<(), BundleError> {
    let file = create_archive(out_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, path) in files {
        zip.start_file(name.as_str(), opts)
            .map_err(|err| BundleError::archive(out_path, err))?;
        let data = fs::read(path).map_err(|err| BundleError::io(path, err))?;
        zip.write_all(&data)
            .map_err(|err| BundleError::io(out_path, err))?;
    }
    zip.finish()
        .map_err(|err| BundleError::archive(run_dir, err))?;
    Ok(())
}
