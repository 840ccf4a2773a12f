//! Filesystem layout under the base download directory.
//!
//! Every job owns `{base}/{job_id}_{folder}` while it runs and produces
//! `{base}/{job_id}_{folder}.zip`. The job id prefix keeps jobs with the same
//! folder name apart and lets the startup sweep map entries back to records.

use crate::JobId;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MAX_NAME_BYTES: usize = 200;
const FALLBACK_FOLDER: &str = "download";

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make `name` usable as a single path component on any common filesystem.
///
/// Separators, wildcard/reserved punctuation and control characters are
/// dropped, surrounding whitespace and trailing dots trimmed, and Windows
/// device names suffixed. May return an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();

    let trimmed = cleaned.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return String::new();
    }

    let mut result = truncate_at_char_boundary(trimmed, MAX_NAME_BYTES).to_string();
    let stem = result.split('.').next().unwrap_or_default().to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        result.push('_');
    }
    result
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].trim_end()
}

/// Sanitized folder name used both on disk and as the archive's root entry.
pub fn folder_name(raw: &str) -> String {
    let name = sanitize_filename(raw);
    if name.is_empty() {
        FALLBACK_FOLDER.to_string()
    } else {
        name
    }
}

pub fn working_directory(base: &Path, job_id: JobId, folder: &str) -> PathBuf {
    base.join(format!("{}_{}", job_id, folder_name(folder)))
}

pub fn archive_path(base: &Path, job_id: JobId, folder: &str) -> PathBuf {
    base.join(format!("{}_{}.zip", job_id, folder_name(folder)))
}

/// Recover the owning job id from a base directory entry name.
pub fn job_id_of(entry_name: &str) -> Option<JobId> {
    let (prefix, _) = entry_name.split_once('_')?;
    Uuid::parse_str(prefix).ok()
}
