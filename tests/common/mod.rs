#![allow(dead_code)]

use async_trait::async_trait;
use ripq::cleanup::CleanupScheduler;
use ripq::fetcher::{FetchError, FetchOutcome, TrackFetcher};
use ripq::orchestrator::Orchestrator;
use ripq::resolver::{ResolveError, ResolvedRequest, Selection, TrackResolver};
use ripq::store::{JobStore, MemoryJobStore, StoreError};
use ripq::{JobId, JobRecord, JobStatus, JobUpdate, Quality, TrackDescriptor};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub fn track(n: u32) -> TrackDescriptor {
    TrackDescriptor {
        name: format!("Song {}", n),
        artist: "The Band".into(),
        artist_id: Some(format!("artist-{}", n)),
        album: "Album".into(),
        album_artist: Some("The Band".into()),
        artwork_url: None,
        track_number: n,
        genre: Some("rock".into()),
    }
}

pub fn tracks(count: u32) -> Vec<TrackDescriptor> {
    (1..=count).map(track).collect()
}

/// Writes `{artist} - {name}.mp3` for every track except the ones listed as
/// failing. With a gate, each fetch first waits for a permit.
#[derive(Default)]
pub struct ScriptedFetcher {
    pub failing: HashSet<u32>,
    pub gate: Option<Arc<Semaphore>>,
    pub calls: AtomicUsize,
    pub qualities: Mutex<Vec<Quality>>,
}

impl ScriptedFetcher {
    pub fn failing(tracks: impl IntoIterator<Item = u32>) -> Self {
        Self {
            failing: tracks.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackFetcher for ScriptedFetcher {
    async fn fetch_and_tag(
        &self,
        track: &TrackDescriptor,
        dest: &Path,
        quality: Quality,
    ) -> Result<FetchOutcome, FetchError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.qualities.lock().unwrap().push(quality);

        if self.failing.contains(&track.track_number) {
            return Ok(FetchOutcome::Skipped {
                reason: "no match".into(),
            });
        }

        let path = dest.join(format!("{} - {}.mp3", track.artist, track.name));
        if path.exists() {
            return Ok(FetchOutcome::AlreadyPresent(path));
        }
        tokio::fs::write(&path, format!("audio of {}", track.name))
            .await
            .map_err(|source| FetchError::Destination {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(FetchOutcome::Saved(path))
    }
}

/// Memory store that keeps every status write, and checks after each update
/// that `archive_path` is present exactly when the job is done.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryJobStore,
    pub statuses: Mutex<Vec<(JobId, JobStatus)>>,
    pub violations: AtomicUsize,
}

impl RecordingStore {
    pub fn statuses_of(&self, id: JobId) -> Vec<JobStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(job, _)| *job == id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn check(&self, record: &JobRecord) {
        if record.archive_path.is_some() != (record.status == JobStatus::Done) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn create(&self, id: JobId, record: JobRecord) -> Result<(), StoreError> {
        let status = record.status;
        self.inner.create(id, record).await?;
        self.statuses.lock().unwrap().push((id, status));
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn set_field(&self, id: JobId, update: JobUpdate) -> Result<(), StoreError> {
        self.inner.set_field(id, update).await?;
        if let Some(record) = self.inner.get(id).await? {
            self.check(&record);
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.iter().rev().find(|(job, _)| *job == id).map(|(_, s)| *s) != Some(record.status) {
                statuses.push((id, record.status));
            }
        }
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list_ids(&self) -> Result<Vec<JobId>, StoreError> {
        self.inner.list_ids().await
    }
}

/// Resolver that always answers with the same folder and tracks, or fails
/// for out-of-range playlist indices.
pub struct StaticResolver {
    pub folder_name: String,
    pub tracks: Vec<TrackDescriptor>,
}

#[async_trait]
impl TrackResolver for StaticResolver {
    async fn resolve(
        &self,
        _token: &str,
        selection: &Selection,
    ) -> Result<ResolvedRequest, ResolveError> {
        if let Selection::Playlist { index } = selection {
            if *index > 0 {
                return Err(ResolveError::IndexOutOfRange {
                    index: *index,
                    len: 1,
                });
            }
        }
        Ok(ResolvedRequest {
            tracks: self.tracks.clone(),
            folder_name: self.folder_name.clone(),
        })
    }
}

pub struct Harness {
    pub base_dir: PathBuf,
    pub store: Arc<RecordingStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub cleanup: Arc<CleanupScheduler>,
    pub orchestrator: Orchestrator,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new(base_dir: &Path, fetcher: ScriptedFetcher, grace: Duration) -> Self {
        let store = Arc::new(RecordingStore::default());
        let fetcher = Arc::new(fetcher);
        let shutdown = CancellationToken::new();
        let cleanup = Arc::new(CleanupScheduler::new(store.clone(), grace, shutdown.clone()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher.clone(),
            cleanup.clone(),
            base_dir.to_path_buf(),
            shutdown.clone(),
        );
        Self {
            base_dir: base_dir.to_path_buf(),
            store,
            fetcher,
            cleanup,
            orchestrator,
            shutdown,
        }
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_terminal(&self, id: JobId) -> JobRecord {
        wait_terminal(self.store.as_ref(), id).await
    }

    pub async fn wait_gone(&self, id: JobId) {
        wait_gone(self.store.as_ref(), id).await
    }
}

pub async fn wait_terminal(store: &dyn JobStore, id: JobId) -> JobRecord {
    for _ in 0..500 {
        if let Some(record) = store.get(id).await.unwrap() {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish in time", id);
}

pub async fn wait_gone(store: &dyn JobStore, id: JobId) {
    for _ in 0..500 {
        if !store.exists(id).await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} was not cleaned up in time", id);
}

pub fn zip_entries(archive: &Path) -> Vec<String> {
    let mut zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
    (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect()
}

/// Executable shell script standing in for yt-dlp. It writes its `--output`
/// template with `%(ext)s` replaced by `ext`, then runs `then`.
#[cfg(unix)]
pub fn fake_downloader(dir: &Path, ext: &str, then: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        "#!/bin/sh\n\
         while [ $# -gt 0 ]; do\n\
           [ \"$1\" = \"--output\" ] && out=\"$2\"\n\
           shift\n\
         done\n\
         printf partial > \"$(printf '%s' \"$out\" | sed 's/%(ext)s/{}/')\"\n\
         {}\n",
        ext, then
    );
    let path = dir.join(format!("fake-yt-dlp-{}", ext));
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}
