//! Turns a user's selection into the ordered track list a job runs on.
//!
//! Resolution happens on the request path, before any job exists: a catalog
//! failure here is reported to the caller and no job is created.

use crate::catalog::{CatalogClient, CatalogError, Track};
use crate::TrackDescriptor;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const LIKED_FOLDER: &str = "Liked Songs";

/// What the user picked. Both sources resolve to the same output shape.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Selection {
    /// A playlist by its position in the user's playlist list.
    Playlist { index: usize },
    /// Positions in the liked list, or every liked track when absent/empty.
    Liked {
        #[serde(default)]
        indices: Option<Vec<usize>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub tracks: Vec<TrackDescriptor>,
    pub folder_name: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("selection index {index} out of range ({len} available)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, token: &str, selection: &Selection) -> Result<ResolvedRequest, ResolveError>;
}

pub struct CatalogResolver {
    client: CatalogClient,
}

impl CatalogResolver {
    pub fn new(client: CatalogClient) -> Self {
        Self { client }
    }

    async fn genres_for(&self, token: &str, tracks: &[Track]) -> HashMap<String, Vec<String>> {
        let ids: Vec<String> = tracks
            .iter()
            .filter_map(|t| t.artists.first().and_then(|a| a.id.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return HashMap::new();
        }

        // Genre is a nice-to-have tag, not worth failing a submission over.
        match self.client.artist_genres(token, &ids).await {
            Ok(genres) => genres,
            Err(err) => {
                warn!(message = "Genre lookup failed, tagging without genres", error = %err);
                HashMap::new()
            }
        }
    }
}

fn pick<T: Clone>(items: &[T], index: usize) -> Result<T, ResolveError> {
    items.get(index).cloned().ok_or(ResolveError::IndexOutOfRange {
        index,
        len: items.len(),
    })
}

fn describe(track: Track, genres: &HashMap<String, Vec<String>>) -> TrackDescriptor {
    let primary = track.artists.into_iter().next();
    let album = track.album;

    let artist_id = primary.as_ref().and_then(|a| a.id.clone());
    let genre = artist_id
        .as_ref()
        .and_then(|id| genres.get(id))
        .and_then(|g| g.last().cloned());

    TrackDescriptor {
        name: track.name,
        artist: primary.map(|a| a.name).unwrap_or_default(),
        artist_id,
        album: album.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
        album_artist: album
            .as_ref()
            .and_then(|a| a.artists.first())
            .map(|a| a.name.clone()),
        artwork_url: album
            .as_ref()
            .and_then(|a| a.images.first())
            .map(|i| i.url.clone()),
        track_number: track.track_number,
        genre,
    }
}

#[async_trait]
impl TrackResolver for CatalogResolver {
    #[instrument(skip(self, token))]
    async fn resolve(&self, token: &str, selection: &Selection) -> Result<ResolvedRequest, ResolveError> {
        let (tracks, folder_name) = match selection {
            Selection::Playlist { index } => {
                let playlists = self.client.playlists(token).await?;
                let playlist = pick(&playlists, *index)?;
                let tracks = self.client.playlist_tracks(token, &playlist.id).await?;
                (tracks, playlist.name)
            }
            Selection::Liked { indices } => {
                let liked = self.client.saved_tracks(token).await?;
                let tracks = match indices {
                    Some(indices) if !indices.is_empty() => indices
                        .iter()
                        .map(|&i| pick(&liked, i))
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => liked,
                };
                (tracks, LIKED_FOLDER.to_string())
            }
        };

        let tracks: Vec<Track> = tracks.into_iter().filter(Track::is_downloadable).collect();
        let genres = self.genres_for(token, &tracks).await;
        debug!("Resolved {} tracks into '{}'", tracks.len(), folder_name);

        Ok(ResolvedRequest {
            tracks: tracks.into_iter().map(|t| describe(t, &genres)).collect(),
            folder_name,
        })
    }
}
