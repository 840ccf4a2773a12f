//! Deferred garbage collection of finished jobs.
//!
//! Once a job reaches a terminal state its working directory, archive and
//! record are removed after a fixed grace period, whether or not the client
//! ever fetched the archive.

use crate::paths;
use crate::store::{JobStore, StoreError};
use crate::{JobId, JobUpdate};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

/// Filesystem leftovers of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub working_directory: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
}

pub struct CleanupScheduler {
    store: Arc<dyn JobStore>,
    delay: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl CleanupScheduler {
    /// Pending cleanups run early, instead of being dropped, once `shutdown`
    /// is cancelled.
    pub fn new(store: Arc<dyn JobStore>, delay: Duration, shutdown: CancellationToken) -> Self {
        Self {
            store,
            delay,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn schedule(&self, job_id: JobId, artifacts: Artifacts) {
        let store = self.store.clone();
        let delay = self.delay;
        let shutdown = self.shutdown.clone();

        debug!(job_id = %job_id, delay_secs = delay.as_secs(), "Scheduling cleanup");
        self.tracker.spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = shutdown.cancelled() => {
                        debug!("Shutting down, cleaning up early");
                    },
                }
                if let Err(err) = cleanup_now(store.as_ref(), job_id, &artifacts).await {
                    warn!(message = "Failed to delete job record", error = ?err);
                }
            }
            .instrument(info_span!("cleanup", job_id = %job_id)),
        );
    }

    /// Wait for every scheduled cleanup to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Delete a job's artifacts and record right away.
///
/// Filesystem removal is best-effort and missing paths are ignored, so calling
/// this again for the same job succeeds.
pub async fn cleanup_now(
    store: &dyn JobStore,
    job_id: JobId,
    artifacts: &Artifacts,
) -> Result<(), StoreError> {
    if let Some(dir) = &artifacts.working_directory {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(path = ?dir, "Removed working directory"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(message = "Failed to remove working directory", path = ?dir, error = ?err),
        }
    }

    if let Some(archive) = &artifacts.archive_path {
        match tokio::fs::remove_file(archive).await {
            Ok(()) => debug!(path = ?archive, "Removed archive"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(message = "Failed to remove archive", path = ?archive, error = ?err),
        }
    }

    store.delete(job_id).await?;
    info!(job_id = %job_id, "Job cleaned up");
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs left non-terminal by a previous process, now marked failed.
    pub interrupted: usize,
    /// Known jobs handed to the scheduler again.
    pub rescheduled: usize,
    /// Base directory entries with no job record, deleted.
    pub orphans_removed: usize,
}

/// Reconcile the base directory and the store after a restart.
///
/// No orchestrator survives a restart, so any job still marked active is
/// failed. Every known job gets its cleanup scheduled again, and entries that
/// belong to no known job are removed immediately.
pub async fn recover_orphans(
    base_dir: &Path,
    store: &dyn JobStore,
    scheduler: &CleanupScheduler,
) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport::default();
    let mut on_disk = scan_base_dir(base_dir).await;

    for job_id in store.list_ids().await? {
        let Some(record) = store.get(job_id).await? else {
            continue;
        };
        let found = on_disk.remove(&job_id).unwrap_or_default();

        if !record.status.is_terminal() {
            warn!(job_id = %job_id, status = %record.status, "Job interrupted by restart");
            store
                .set_field(
                    job_id,
                    JobUpdate::Failed {
                        error_detail: "interrupted by restart".to_string(),
                    },
                )
                .await?;
            report.interrupted += 1;
        }

        scheduler.schedule(
            job_id,
            Artifacts {
                working_directory: record.working_directory.or(found.working_directory),
                archive_path: record.archive_path.or(found.archive_path),
            },
        );
        report.rescheduled += 1;
    }

    for (job_id, artifacts) in on_disk {
        debug!(job_id = %job_id, "Removing orphaned download artifacts");
        let mut removed = 0;
        if let Some(dir) = &artifacts.working_directory {
            if tokio::fs::remove_dir_all(dir).await.is_ok() {
                removed += 1;
            }
        }
        if let Some(archive) = &artifacts.archive_path {
            if tokio::fs::remove_file(archive).await.is_ok() {
                removed += 1;
            }
        }
        report.orphans_removed += removed;
    }

    Ok(report)
}

async fn scan_base_dir(base_dir: &Path) -> HashMap<JobId, Artifacts> {
    let mut found: HashMap<JobId, Artifacts> = HashMap::new();
    let mut entries = match tokio::fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(message = "Cannot read base directory", path = ?base_dir, error = ?err);
            return found;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(job_id) = paths::job_id_of(&name.to_string_lossy()) else {
            continue;
        };
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        let slot = found.entry(job_id).or_default();
        if file_type.is_dir() {
            slot.working_directory = Some(entry.path());
        } else if file_type.is_file() {
            slot.archive_path = Some(entry.path());
        }
    }
    found
}
