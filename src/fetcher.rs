//! Contract for the per-track fetch-and-tag step.

use crate::{Quality, TrackDescriptor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result of one fetch attempt that did not hit an infrastructure problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Saved(PathBuf),
    /// Output from an earlier invocation was found and reused.
    AlreadyPresent(PathBuf),
    /// The track could not be acquired; the job carries on without it.
    Skipped { reason: String },
}

/// Failures that make continuing the job pointless, e.g. an unwritable
/// destination or a downloader that cannot be started at all.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("destination {path:?} is not usable: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch downloader {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait TrackFetcher: Send + Sync {
    /// Acquire `track` into `dest` and tag it.
    ///
    /// Must be safe to call again for the same track and directory: existing
    /// output is detected and reported as [`FetchOutcome::AlreadyPresent`].
    async fn fetch_and_tag(
        &self,
        track: &TrackDescriptor,
        dest: &Path,
        quality: Quality,
    ) -> Result<FetchOutcome, FetchError>;
}
