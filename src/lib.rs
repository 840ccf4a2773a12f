use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod orchestrator;
pub mod packaging;
pub mod paths;
pub mod resolver;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod ytdlp;

pub type JobId = Uuid;

/// Lifecycle of a download job.
///
/// `queued → downloading → zipping → done`, with `cancelled` reachable from
/// `downloading`/`zipping` and `failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "download_status", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Zipping,
    Done,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Zipping => "zipping",
            JobStatus::Done => "done",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Downloading, Zipping)
                | (Zipping, Done)
                | (Downloading, Cancelled)
                | (Zipping, Cancelled)
                | (Queued, Failed)
                | (Downloading, Failed)
                | (Zipping, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per job, as seen by every reader of the job store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub working_directory: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub error_detail: Option<String>,
}

impl JobRecord {
    pub fn queued() -> Self {
        JobRecord {
            status: JobStatus::Queued,
            cancel_requested: false,
            working_directory: None,
            archive_path: None,
            error_detail: None,
        }
    }

    pub fn apply(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::Status(status) => self.status = status,
            // Never reset once raised.
            JobUpdate::CancelRequested => self.cancel_requested = true,
            JobUpdate::WorkingDirectory(path) => self.working_directory = Some(path),
            JobUpdate::Done { archive_path } => {
                self.status = JobStatus::Done;
                self.archive_path = Some(archive_path);
            }
            JobUpdate::Failed { error_detail } => {
                self.status = JobStatus::Failed;
                self.error_detail = Some(error_detail);
            }
        }
    }
}

/// A single-owner field update.
///
/// `Done` and `Failed` carry their companion field so that `archive_path` and
/// `error_detail` never appear without the matching status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Status(JobStatus),
    CancelRequested,
    WorkingDirectory(PathBuf),
    Done { archive_path: PathBuf },
    Failed { error_detail: String },
}

/// A catalog track, resolved once at submission and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub name: String,
    pub artist: String,
    pub artist_id: Option<String>,
    pub album: String,
    pub album_artist: Option<String>,
    pub artwork_url: Option<String>,
    pub track_number: u32,
    pub genre: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "190")]
    Standard,
    #[default]
    #[serde(rename = "320")]
    High,
}

impl Quality {
    pub fn kbps(&self) -> u16 {
        match self {
            Quality::Standard => 190,
            Quality::High => 320,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kbps())
    }
}
