//! Minimal client for the remote catalog (Spotify Web API).
//!
//! Only the reads needed to turn a user's selection into track descriptors:
//! their playlists, a playlist's items, their saved ("liked") tracks and the
//! genres of a batch of artists. Authentication happens elsewhere; every call
//! takes the session's bearer token.

use futures::future::join_all;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

pub const DEFAULT_API_URL: &str = "https://api.spotify.com/v1";

const ARTIST_BATCH: usize = 50;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog session is missing or expired")]
    Unauthorized,

    #[error("rate limited by the catalog API")]
    RateLimited,

    #[error("catalog API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistRef {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Album {
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// A playable item. Playlists may also hold podcast episodes and local files,
/// which deserialize here too but are not [`Track::is_downloadable`].
#[derive(Debug, Clone, Deserialize)]
pub struct Track {
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    pub album: Option<Album>,
    #[serde(default)]
    pub track_number: u32,
    #[serde(default)]
    pub is_local: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Track {
    pub fn is_downloadable(&self) -> bool {
        self.kind == "track" && !self.is_local && !self.artists.is_empty() && self.album.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<Track>,
}

#[derive(Debug, Deserialize)]
struct SavedTrack {
    track: Track,
}

#[derive(Debug, Deserialize)]
struct Artist {
    id: String,
    #[serde(default)]
    genres: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Artists {
    artists: Vec<Option<Artist>>,
}

#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> CatalogResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("ripq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &str, url: &str) -> CatalogResult<T> {
        let response = self.http.get(url).bearer_auth(token).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED => Err(CatalogError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => Err(CatalogError::RateLimited),
            status => Err(CatalogError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Follow `next` links until the collection is exhausted.
    async fn collect_pages<T: DeserializeOwned>(
        &self,
        token: &str,
        first: String,
    ) -> CatalogResult<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next {
            let page: Page<T> = self.get_json(token, &url).await?;
            debug!("Fetched {} items from {}", page.items.len(), url);
            items.extend(page.items);
            next = page.next;
        }
        Ok(items)
    }

    #[instrument(skip_all)]
    pub async fn playlists(&self, token: &str) -> CatalogResult<Vec<Playlist>> {
        self.collect_pages(token, format!("{}/me/playlists?limit=50", self.base_url))
            .await
    }

    /// Tracks of a playlist in playlist order. Removed, local and non-music
    /// items are dropped.
    #[instrument(skip(self, token))]
    pub async fn playlist_tracks(&self, token: &str, playlist_id: &str) -> CatalogResult<Vec<Track>> {
        let items: Vec<PlaylistItem> = self
            .collect_pages(
                token,
                format!("{}/playlists/{}/tracks?limit=100", self.base_url, playlist_id),
            )
            .await?;
        Ok(items
            .into_iter()
            .filter_map(|item| item.track)
            .filter(Track::is_downloadable)
            .collect())
    }

    /// Every saved track, most recently saved first.
    #[instrument(skip_all)]
    pub async fn saved_tracks(&self, token: &str) -> CatalogResult<Vec<Track>> {
        let items: Vec<SavedTrack> = self
            .collect_pages(token, format!("{}/me/tracks?limit=50", self.base_url))
            .await?;
        Ok(items.into_iter().map(|saved| saved.track).collect())
    }

    /// Genres keyed by artist id. Unknown ids are simply absent.
    #[instrument(skip_all, fields(artists = artist_ids.len()))]
    pub async fn artist_genres(
        &self,
        token: &str,
        artist_ids: &[String],
    ) -> CatalogResult<HashMap<String, Vec<String>>> {
        let requests = artist_ids.chunks(ARTIST_BATCH).map(|chunk| {
            let url = format!("{}/artists?ids={}", self.base_url, chunk.join(","));
            async move { self.get_json::<Artists>(token, &url).await }
        });

        let mut genres = HashMap::new();
        for batch in join_all(requests).await {
            for artist in batch?.artists.into_iter().flatten() {
                genres.insert(artist.id, artist.genres);
            }
        }
        Ok(genres)
    }
}
