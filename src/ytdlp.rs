//! Fetch-and-tag backed by the `yt-dlp` executable and `lofty`.
//!
//! Each track is searched by title and artist, extracted to mp3 at the
//! requested bitrate, then tagged with the catalog metadata and cover art.

use crate::fetcher::{FetchError, FetchOutcome, TrackFetcher};
use crate::paths::sanitize_filename;
use crate::{Quality, TrackDescriptor};
use anyhow::anyhow;
use async_trait::async_trait;
use lofty::{Accessor, ItemKey, Picture, PictureType, Probe, Tag, TagExt, TaggedFileExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

pub const DEFAULT_PROGRAM: &str = "yt-dlp";

pub struct YtDlpFetcher {
    program: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl YtDlpFetcher {
    /// `timeout` bounds one downloader run; a run that exceeds it is killed
    /// and the track skipped.
    pub fn new(program: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            program: program.into(),
            timeout,
            http,
        })
    }

    async fn download(
        &self,
        track: &TrackDescriptor,
        dest: &Path,
        stem: &str,
        quality: Quality,
    ) -> Result<Result<PathBuf, String>, FetchError> {
        let mut command = Command::new(&self.program);
        command
            .args(["--no-playlist", "--no-progress", "--quiet"])
            .args(["--format", "bestaudio/best", "--extract-audio"])
            .args(["--audio-format", "mp3"])
            .arg("--audio-quality")
            .arg(format!("{}K", quality.kbps()))
            .arg("--output")
            .arg(dest.join(format!("{}.%(ext)s", stem)))
            .args(["--print", "after_move:filepath"])
            .arg(format!("ytsearch1:{} {}", track.name, track.artist))
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output.map_err(|source| FetchError::Launch {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => {
                return Ok(Err(format!(
                    "downloader timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("downloader exited with an error")
                .to_string();
            return Ok(Err(reason));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(printed) = stdout.lines().rev().find(|l| !l.trim().is_empty()) {
            let path = PathBuf::from(printed.trim());
            if path.is_file() {
                return Ok(Ok(path));
            }
        }

        match find_existing(dest, stem).await? {
            Some(path) => Ok(Ok(path)),
            None => Ok(Err("downloader reported no output file".to_string())),
        }
    }

    async fn artwork(&self, url: &str) -> Option<Vec<u8>> {
        let response = match self.http.get(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(err) => {
                warn!(message = "Cover art unavailable", url = %url, error = %err);
                return None;
            }
        };
        match response.bytes().await {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(err) => {
                warn!(message = "Cover art download interrupted", url = %url, error = %err);
                None
            }
        }
    }
}

/// File name stem for a track, shared by the downloader template and the
/// already-present check.
pub fn file_stem(track: &TrackDescriptor) -> String {
    let stem = sanitize_filename(&format!("{} - {}", track.artist, track.name));
    if stem.is_empty() {
        format!("Track {}", track.track_number)
    } else {
        stem
    }
}

/// A finished file in `dest` named `{stem}.{ext}`. In-progress downloads are
/// `{stem}.{ext}.part` and never match.
async fn find_existing(dest: &Path, stem: &str) -> Result<Option<PathBuf>, FetchError> {
    let destination = |source| FetchError::Destination {
        path: dest.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dest).await.map_err(destination)?;
    while let Some(entry) = entries.next_entry().await.map_err(destination)? {
        let path = entry.path();
        let stem_matches = path.file_stem().is_some_and(|s| s == stem);
        let is_audio = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| !matches!(e, "part" | "ytdl" | "tmp"));
        if stem_matches && is_audio && path.is_file() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Whether `name` is `{stem}.{ext...}`, e.g. `stem.webm.part` or
/// `stem.f251.webm`, as the downloader names its outputs and temporaries.
fn is_attempt_file(name: &str, stem: &str) -> bool {
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '.'))
}

/// Remove whatever a failed attempt left in `dest`, finished or not, so the
/// track is absent from the archive and not mistaken for a reusable file.
async fn discard_attempt(dest: &Path, stem: &str) {
    let mut entries = match tokio::fs::read_dir(dest).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(message = "Cannot scan destination for leftovers", path = ?dest, error = %err);
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if !is_attempt_file(&entry.file_name().to_string_lossy(), stem) {
            continue;
        }
        let path = entry.path();
        let removed = if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => debug!(path = ?path, "Discarded leftover of failed download"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(message = "Failed to discard leftover", path = ?path, error = %err),
        }
    }
}

fn write_tags(path: &Path, track: &TrackDescriptor, artwork: Option<Vec<u8>>) -> anyhow::Result<()> {
    let mut tagged = Probe::open(path)?.read()?;
    if tagged.primary_tag().is_none() {
        let tag_type = tagged.primary_tag_type();
        tagged.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged
        .primary_tag_mut()
        .ok_or_else(|| anyhow!("format does not support tags"))?;

    tag.set_title(track.name.clone());
    tag.set_artist(track.artist.clone());
    tag.set_album(track.album.clone());
    if let Some(album_artist) = &track.album_artist {
        tag.insert_text(ItemKey::AlbumArtist, album_artist.clone());
    }
    if let Some(genre) = &track.genre {
        tag.set_genre(genre.clone());
    }
    if track.track_number > 0 {
        tag.set_track(track.track_number);
    }

    if let Some(data) = artwork {
        let mut picture = Picture::from_reader(&mut data.as_slice())?;
        picture.set_pic_type(PictureType::CoverFront);
        tag.remove_picture_type(PictureType::CoverFront);
        tag.push_picture(picture);
    }

    tag.save_to_path(path)?;
    Ok(())
}

#[async_trait]
impl TrackFetcher for YtDlpFetcher {
    #[instrument(skip_all, fields(track = %track.name, artist = %track.artist))]
    async fn fetch_and_tag(
        &self,
        track: &TrackDescriptor,
        dest: &Path,
        quality: Quality,
    ) -> Result<FetchOutcome, FetchError> {
        let stem = file_stem(track);
        if let Some(existing) = find_existing(dest, &stem).await? {
            return Ok(FetchOutcome::AlreadyPresent(existing));
        }

        let path = match self.download(track, dest, &stem, quality).await? {
            Ok(path) => path,
            Err(reason) => {
                discard_attempt(dest, &stem).await;
                return Ok(FetchOutcome::Skipped { reason });
            }
        };
        debug!(path = ?path, "Downloaded");

        let artwork = match &track.artwork_url {
            Some(url) => self.artwork(url).await,
            None => None,
        };

        // A file without tags is still worth shipping.
        let tag_path = path.clone();
        let descriptor = track.clone();
        match tokio::task::spawn_blocking(move || write_tags(&tag_path, &descriptor, artwork)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(message = "Tagging failed", path = ?path, error = %err),
            Err(err) => warn!(message = "Tagging task panicked", error = %err),
        }

        Ok(FetchOutcome::Saved(path))
    }
}
