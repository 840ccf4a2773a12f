use crate::catalog::{CatalogClient, CatalogError};
use crate::cleanup::{self, CleanupScheduler};
use crate::config::ConfigContext;
use crate::db::PgJobStore;
use crate::orchestrator::Orchestrator;
use crate::resolver::{CatalogResolver, ResolveError, Selection, TrackResolver};
use crate::store::{JobStore, MemoryJobStore, StoreError};
use crate::ytdlp::YtDlpFetcher;
use crate::{JobId, JobStatus, JobUpdate, Quality};
use axum::body::Body;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub orchestrator: Orchestrator,
    pub resolver: Arc<dyn TrackResolver>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("download is not ready (status: {status})")]
    NotReady { job_id: JobId, status: JobStatus },

    #[error("missing or malformed session")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::IndexOutOfRange { .. } => ApiError::BadRequest(err.to_string()),
            ResolveError::Catalog(err) => ApiError::Catalog(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::NotReady { .. } => StatusCode::CONFLICT,
            ApiError::Unauthorized | ApiError::Catalog(CatalogError::Unauthorized) => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Catalog(CatalogError::RateLimited) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Catalog(_) => StatusCode::BAD_GATEWAY,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(message = "Request failed", error = %self);
        }

        let body = match &self {
            ApiError::NotReady { job_id, status } => serde_json::json!({
                "error": self.to_string(),
                "status": status,
                "status_url": status_url(*job_id),
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Bearer token of the caller's catalog session.
pub struct Session(pub String);

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| Session(token.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(flatten)]
    pub selection: Selection,
    #[serde(default)]
    pub quality: Quality,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub error: Option<String>,
}

fn status_url(job_id: JobId) -> String {
    format!("/status/{}", job_id)
}

/// Ids that do not parse cannot name a job, so they are simply unknown.
fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound)
}

async fn submit_download(
    State(state): State<AppState>,
    session: Session,
    Json(request): Json<DownloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.resolver.resolve(&session.0, &request.selection).await?;

    let job_id = Uuid::new_v4();
    state
        .orchestrator
        .submit(job_id, resolved.tracks, &resolved.folder_name, request.quality)
        .await?;
    info!(job_id = %job_id, folder = %resolved.folder_name, quality = %request.quality, "Download submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status_url: status_url(job_id),
        }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let record = state.store.get(job_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(StatusResponse {
        job_id,
        status: record.status,
        cancel_requested: record.cancel_requested,
        error: record.error_detail,
    }))
}

/// Machine-readable variant for pollers: just the status string.
async fn job_status_json(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let record = state.store.get(job_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::json!({ "status": record.status })))
}

async fn download_archive(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let record = state.store.get(job_id).await?.ok_or(ApiError::NotFound)?;

    let archive = match (record.status, record.archive_path) {
        (JobStatus::Done, Some(archive)) => archive,
        (status, _) => return Err(ApiError::NotReady { job_id, status }),
    };

    // Cleanup may have won the race since the record was read.
    let file = tokio::fs::File::open(&archive)
        .await
        .map_err(|_| ApiError::NotFound)?;
    let length = file.metadata().await.map(|m| m.len()).ok();

    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download.zip".to_string());
    let download_name = file_name
        .strip_prefix(&format!("{}_", job_id))
        .unwrap_or(&file_name)
        .to_string();

    debug!(job_id = %job_id, name = %download_name, "Streaming archive");
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&download_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

/// `attachment` with an ASCII fallback name plus the exact UTF-8 name.
fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(name)
    )
}

/// Raise the cancel flag of a running job. Finished jobs are left untouched.
async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let record = state.store.get(job_id).await?.ok_or(ApiError::NotFound)?;

    let mut cancel_requested = record.cancel_requested;
    if !record.status.is_terminal() && !record.cancel_requested {
        match state
            .store
            .set_field(job_id, JobUpdate::CancelRequested)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(ApiError::NotFound),
            Err(err) => return Err(err.into()),
        }
        cancel_requested = true;
        info!(job_id = %job_id, "Cancellation requested");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            job_id,
            status: record.status,
            cancel_requested,
            error: record.error_detail,
        }),
    ))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", post(submit_download))
        .route("/download/{job_id}", get(download_archive))
        .route("/status/{job_id}", get(job_status))
        .route("/status/{job_id}/json", get(job_status_json))
        .route("/cancel/{job_id}", post(cancel_job))
        .with_state(state)
}

#[instrument(skip_all, fields(bind = %config.bind))]
pub async fn serve(cancel_token: CancellationToken, config: ConfigContext) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.base_dir).await?;

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            debug!("Connecting to database");
            Arc::new(PgJobStore::connect(url, config.max_connections).await?)
        }
        None => {
            warn!("No database configured, jobs will not survive a restart");
            Arc::new(MemoryJobStore::new())
        }
    };

    let cleanup = Arc::new(CleanupScheduler::new(
        store.clone(),
        config.grace_period(),
        cancel_token.clone(),
    ));
    let report = cleanup::recover_orphans(&config.base_dir, store.as_ref(), &cleanup).await?;
    if report != Default::default() {
        info!(?report, "Recovered state from a previous run");
    }

    let fetcher = Arc::new(YtDlpFetcher::new(
        config.ytdlp_path.clone(),
        config.fetch_timeout(),
    )?);
    let resolver = Arc::new(CatalogResolver::new(CatalogClient::new(
        config.catalog_api_url.clone(),
    )?));
    let orchestrator = Orchestrator::new(
        store.clone(),
        fetcher,
        cleanup.clone(),
        config.base_dir.clone(),
        cancel_token.clone(),
    );

    let app = router(AppState {
        store,
        orchestrator: orchestrator.clone(),
        resolver,
    });

    let listener = TcpListener::bind(config.bind).await?;
    info!("Listening on {}", listener.local_addr()?);

    let shutdown = cancel_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    debug!("Waiting for running jobs");
    orchestrator.shutdown().await;
    debug!("Flushing pending cleanups");
    cleanup.shutdown().await;

    info!("Server stopped.");

    Ok(())
}
