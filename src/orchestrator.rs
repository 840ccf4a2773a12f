//! Drives one download job from `queued` to a terminal state.
//!
//! Each submitted job gets its own task. Tracks are fetched strictly in order,
//! one at a time, and cancellation is only observed at checkpoints between
//! tracks (and once more before packaging), so a cancel request takes effect
//! within one track's fetch time and never interrupts a fetch in flight.

use crate::cleanup::{Artifacts, CleanupScheduler};
use crate::fetcher::{FetchError, FetchOutcome, TrackFetcher};
use crate::packaging::{self, PackageError};
use crate::paths;
use crate::store::{JobStore, StoreError};
use crate::{JobId, JobRecord, JobStatus, JobUpdate, Quality, TrackDescriptor};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::*;

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: JobId,
    pub tracks: Vec<TrackDescriptor>,
    pub folder_name: String,
    pub quality: Quality,
}

/// Job-level failures. Anything in here ends the job as `failed`.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error("cannot create working directory {path:?}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("packaging failed: {0}")]
    Package(#[from] PackageError),

    #[error("job store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

/// What the orchestrator knows about its own job while driving it. It is the
/// only writer of `status`, so this never disagrees with the store.
struct Execution {
    id: JobId,
    status: JobStatus,
    artifacts: Artifacts,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn TrackFetcher>,
    cleanup: Arc<CleanupScheduler>,
    base_dir: PathBuf,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn TrackFetcher>,
        cleanup: Arc<CleanupScheduler>,
        base_dir: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            fetcher,
            cleanup,
            base_dir,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Record the job as `queued` and start driving it in the background.
    ///
    /// Returns as soon as the record exists. Fails if the id is already in
    /// use, which keeps a second worker from ever driving the same job.
    pub async fn submit(
        &self,
        id: JobId,
        tracks: Vec<TrackDescriptor>,
        folder_name: &str,
        quality: Quality,
    ) -> Result<(), StoreError> {
        self.store.create(id, JobRecord::queued()).await?;
        debug!(message = "Job queued", job_id = %id, tracks = tracks.len());

        let job = DownloadJob {
            id,
            tracks,
            folder_name: folder_name.to_string(),
            quality,
        };
        let this = self.clone();
        self.tracker.spawn(
            async move {
                this.run(job).await;
            }
            .instrument(info_span!("job", job_id = %id)),
        );
        Ok(())
    }

    /// Drive `job` to a terminal state, then schedule its cleanup.
    ///
    /// The record must already exist.
    pub async fn run(&self, job: DownloadJob) -> JobStatus {
        let mut exec = Execution {
            id: job.id,
            status: JobStatus::Queued,
            artifacts: Artifacts::default(),
        };

        let status = match self.drive(&job, &mut exec).await {
            Ok(status) => status,
            Err(failure) => {
                error!(message = "Job failed", error = %failure);
                self.fail(&mut exec, failure.to_string()).await
            }
        };

        info!(status = %status, "Job finished");
        self.cleanup.schedule(job.id, exec.artifacts);
        status
    }

    async fn drive(&self, job: &DownloadJob, exec: &mut Execution) -> Result<JobStatus, JobFailure> {
        let dir = paths::working_directory(&self.base_dir, job.id, &job.folder_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| JobFailure::WorkingDirectory {
                path: dir.clone(),
                source,
            })?;
        exec.artifacts.working_directory = Some(dir.clone());
        self.store
            .set_field(job.id, JobUpdate::WorkingDirectory(dir.clone()))
            .await?;

        self.transition(exec, JobStatus::Downloading).await?;

        let total = job.tracks.len();
        let mut fetched = 0usize;
        for (index, track) in job.tracks.iter().enumerate() {
            if self.checkpoint(exec).await? {
                return Ok(exec.status);
            }

            info!("[{}/{}] Fetching: {} - {}", index + 1, total, track.artist, track.name);
            match self.fetcher.fetch_and_tag(track, &dir, job.quality).await? {
                FetchOutcome::Saved(path) => {
                    debug!(path = ?path, "Track saved");
                    fetched += 1;
                }
                FetchOutcome::AlreadyPresent(path) => {
                    debug!(path = ?path, "Track already present");
                    fetched += 1;
                }
                FetchOutcome::Skipped { reason } => {
                    warn!(track = %track.name, artist = %track.artist, reason = %reason, "Track skipped");
                }
            }
        }

        self.transition(exec, JobStatus::Zipping).await?;
        if self.checkpoint(exec).await? {
            return Ok(exec.status);
        }

        debug!("Packaging {} of {} tracks", fetched, total);
        let archive = paths::archive_path(&self.base_dir, job.id, &job.folder_name);
        exec.artifacts.archive_path = Some(archive.clone());
        let archive =
            packaging::package_blocking(dir, paths::folder_name(&job.folder_name), archive).await?;

        self.check_transition(exec, JobStatus::Done)?;
        self.store
            .set_field(
                job.id,
                JobUpdate::Done {
                    archive_path: archive,
                },
            )
            .await?;
        exec.status = JobStatus::Done;
        Ok(JobStatus::Done)
    }

    /// Returns `true` if the job was cancelled here.
    async fn checkpoint(&self, exec: &mut Execution) -> Result<bool, JobFailure> {
        let requested = if self.shutdown.is_cancelled() {
            debug!("Shutdown in progress, stopping job");
            true
        } else {
            self.store
                .get(exec.id)
                .await?
                .ok_or(StoreError::NotFound(exec.id))?
                .cancel_requested
        };

        if requested {
            self.transition(exec, JobStatus::Cancelled).await?;
        }
        Ok(requested)
    }

    fn check_transition(&self, exec: &Execution, next: JobStatus) -> Result<(), JobFailure> {
        if exec.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(JobFailure::IllegalTransition {
                from: exec.status,
                to: next,
            })
        }
    }

    async fn transition(&self, exec: &mut Execution, next: JobStatus) -> Result<(), JobFailure> {
        self.check_transition(exec, next)?;
        self.store.set_field(exec.id, JobUpdate::Status(next)).await?;
        debug!(message = "Job transition", from = %exec.status, to = %next);
        exec.status = next;
        Ok(())
    }

    async fn fail(&self, exec: &mut Execution, error_detail: String) -> JobStatus {
        if !exec.status.can_transition_to(JobStatus::Failed) {
            // Already terminal; the failure happened after the fact.
            return exec.status;
        }
        if let Err(err) = self
            .store
            .set_field(exec.id, JobUpdate::Failed { error_detail })
            .await
        {
            error!(message = "Could not record job failure", error = ?err);
        }
        exec.status = JobStatus::Failed;
        JobStatus::Failed
    }

    /// Stop accepting work and wait for running jobs to reach a terminal state.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn track(n: u32) -> TrackDescriptor {
        TrackDescriptor {
            name: format!("Song {}", n),
            artist: "Band".into(),
            artist_id: None,
            album: "Album".into(),
            album_artist: None,
            artwork_url: None,
            track_number: n,
            genre: None,
        }
    }

    /// Writes a file per track and cancels its own job after `cancel_after`
    /// fetches.
    struct CancellingFetcher {
        store: Arc<dyn JobStore>,
        id: JobId,
        cancel_after: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TrackFetcher for CancellingFetcher {
        async fn fetch_and_tag(
            &self,
            track: &TrackDescriptor,
            dest: &Path,
            _quality: Quality,
        ) -> Result<FetchOutcome, FetchError> {
            let path = dest.join(format!("{}.mp3", track.name));
            std::fs::write(&path, b"audio").unwrap();
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_after {
                self.store
                    .set_field(self.id, JobUpdate::CancelRequested)
                    .await
                    .unwrap();
            }
            Ok(FetchOutcome::Saved(path))
        }
    }

    struct BrokenFetcher;

    #[async_trait]
    impl TrackFetcher for BrokenFetcher {
        async fn fetch_and_tag(
            &self,
            _track: &TrackDescriptor,
            dest: &Path,
            _quality: Quality,
        ) -> Result<FetchOutcome, FetchError> {
            Err(FetchError::Destination {
                path: dest.to_path_buf(),
                source: std::io::Error::other("read-only file system"),
            })
        }
    }

    fn orchestrator(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn TrackFetcher>,
        base: &Path,
    ) -> Orchestrator {
        let token = CancellationToken::new();
        let cleanup = Arc::new(CleanupScheduler::new(
            store.clone(),
            Duration::from_secs(3600),
            token.clone(),
        ));
        Orchestrator::new(store, fetcher, cleanup, base.to_path_buf(), token)
    }

    async fn queued(store: &Arc<dyn JobStore>, tracks: u32) -> DownloadJob {
        let id = Uuid::new_v4();
        store.create(id, JobRecord::queued()).await.unwrap();
        DownloadJob {
            id,
            tracks: (1..=tracks).map(track).collect(),
            folder_name: "Mix".into(),
            quality: Quality::High,
        }
    }

    #[tokio::test]
    async fn cancel_mid_job_stops_before_next_track() {
        let tmp = tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = queued(&store, 5).await;
        let fetcher = Arc::new(CancellingFetcher {
            store: store.clone(),
            id: job.id,
            cancel_after: 2,
            calls: AtomicUsize::new(0),
        });

        let orch = orchestrator(store.clone(), fetcher.clone(), tmp.path());
        let status = orch.run(job.clone()).await;

        assert_eq!(status, JobStatus::Cancelled);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        let record = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.archive_path.is_none());
        assert!(!paths::archive_path(tmp.path(), job.id, "Mix").exists());
    }

    #[tokio::test]
    async fn cancel_after_last_track_skips_packaging() {
        let tmp = tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = queued(&store, 3).await;
        let fetcher = Arc::new(CancellingFetcher {
            store: store.clone(),
            id: job.id,
            cancel_after: 3,
            calls: AtomicUsize::new(0),
        });

        let orch = orchestrator(store.clone(), fetcher, tmp.path());
        assert_eq!(orch.run(job.clone()).await, JobStatus::Cancelled);
        assert!(!paths::archive_path(tmp.path(), job.id, "Mix").exists());
    }

    #[tokio::test]
    async fn infrastructure_failure_fails_the_job() {
        let tmp = tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = queued(&store, 2).await;

        let orch = orchestrator(store.clone(), Arc::new(BrokenFetcher), tmp.path());
        assert_eq!(orch.run(job.clone()).await, JobStatus::Failed);

        let record = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.archive_path.is_none());
        assert!(record
            .error_detail
            .unwrap()
            .contains("read-only file system"));
    }

    #[tokio::test]
    async fn unwritable_base_dir_fails_from_queued() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = queued(&store, 1).await;
        let orch = orchestrator(store.clone(), Arc::new(BrokenFetcher), &blocker);

        assert_eq!(orch.run(job.clone()).await, JobStatus::Failed);
        let record = store.get(job.id).await.unwrap().unwrap();
        assert!(record.working_directory.is_none());
        assert!(record.error_detail.unwrap().contains("working directory"));
    }

    #[tokio::test]
    async fn shutdown_cancels_at_next_checkpoint() {
        let tmp = tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = queued(&store, 2).await;
        let token = CancellationToken::new();
        let cleanup = Arc::new(CleanupScheduler::new(
            store.clone(),
            Duration::from_secs(3600),
            token.clone(),
        ));
        let orch = Orchestrator::new(
            store.clone(),
            Arc::new(BrokenFetcher),
            cleanup.clone(),
            tmp.path().to_path_buf(),
            token.clone(),
        );

        token.cancel();
        assert_eq!(orch.run(job.clone()).await, JobStatus::Cancelled);

        cleanup.shutdown().await;
        assert!(!store.exists(job.id).await.unwrap());
        assert!(!paths::working_directory(tmp.path(), job.id, "Mix").exists());
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let tmp = tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let orch = orchestrator(store.clone(), Arc::new(BrokenFetcher), tmp.path());
        let id = Uuid::new_v4();

        orch.submit(id, vec![], "Mix", Quality::High).await.unwrap();
        let err = orch.submit(id, vec![], "Mix", Quality::High).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        orch.shutdown().await;
    }
}
