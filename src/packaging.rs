//! Turns a finished working directory into a single zip archive.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("working directory {0:?} does not exist")]
    MissingDirectory(PathBuf),

    #[error("failed to walk working directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("packaging task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Write every regular file under `working_directory` into `archive_path`.
///
/// Entries are stored as `{root}/{relative path}` so unpacking yields one
/// folder. The root directory entry is always written, which keeps an archive
/// made from an empty directory valid and still rooted.
#[instrument(skip_all, fields(dir = ?working_directory, archive = ?archive_path))]
pub fn package(
    working_directory: &Path,
    root: &str,
    archive_path: &Path,
) -> Result<PathBuf, PackageError> {
    if !working_directory.is_dir() {
        return Err(PackageError::MissingDirectory(
            working_directory.to_path_buf(),
        ));
    }

    let file = File::create(archive_path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    zip.add_directory(format!("{}/", root), entry_options(0))?;

    let mut count = 0usize;
    for entry in WalkDir::new(working_directory).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry_name(root, working_directory, entry.path());
        let size = entry.metadata()?.len();
        zip.start_file(name, entry_options(size))?;

        let mut source = File::open(entry.path())?;
        io::copy(&mut source, &mut zip)?;
        count += 1;
    }

    let mut writer = zip.finish()?;
    writer.flush()?;

    debug!("Packaged {} files", count);
    Ok(archive_path.to_path_buf())
}

/// [`package`] on the blocking pool.
pub async fn package_blocking(
    working_directory: PathBuf,
    root: String,
    archive_path: PathBuf,
) -> Result<PathBuf, PackageError> {
    tokio::task::spawn_blocking(move || package(&working_directory, &root, &archive_path)).await?
}

fn entry_options(size: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(size >= u32::MAX as u64)
}

fn entry_name(root: &str, base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let mut name = root.to_string();
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}
