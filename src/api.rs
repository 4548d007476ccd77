//! HTTP API consumed by the control-panel frontend

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::backup::executor::BackupExecutor;
use crate::backup::naming::BackupId;
use crate::backup::registry::{BackupKind, JobLookup, JobStatus};
use crate::backup::restore::{RestoreService, is_artifact_name, resolve_artifact};
use crate::backup::settings::{ScheduleSettings, load_settings, save_settings};
use crate::backup::{BackupError, storage};
use crate::sites::{Site, SiteDirectory};

/// Shared state of the HTTP handlers
pub struct AppState {
    pub sites: Arc<dyn SiteDirectory>,
    pub executor: BackupExecutor,
    pub restore: RestoreService,
}

type ApiResult<T> = Result<T, BackupError>;

impl IntoResponse for BackupError {
    fn into_response(self) -> Response {
        let status = match &self {
            BackupError::SiteNotFound(_) | BackupError::BackupNotFound(_) => StatusCode::NOT_FOUND,
            BackupError::Validation(_) | BackupError::Config(_) => StatusCode::BAD_REQUEST,
            BackupError::Command(_) | BackupError::Io(_) | BackupError::Json(_) => {
                error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sites", get(list_sites_handler))
        .route("/api/sites/refresh", post(refresh_sites_handler))
        .route("/api/site/{domain}/backup", post(create_backup_handler))
        .route(
            "/api/site/{domain}/backup/{backup_id}/status",
            get(backup_status_handler),
        )
        .route("/api/site/{domain}/backups", get(list_backups_handler))
        .route("/api/site/{domain}/backups/active", get(active_backups_handler))
        .route(
            "/api/site/{domain}/backups/{folder}",
            delete(delete_backup_handler),
        )
        .route(
            "/api/site/{domain}/backups/{folder}/{file}/download",
            get(download_backup_handler),
        )
        .route(
            "/api/site/{domain}/backup-settings",
            get(get_settings_handler).post(save_settings_handler),
        )
        .route(
            "/api/site/{domain}/database/restore",
            post(restore_database_handler),
        )
        .route("/api/site/{domain}/files/restore", post(restore_files_handler))
        .with_state(state)
}

async fn find_site(state: &AppState, domain: &str) -> ApiResult<Site> {
    state
        .sites
        .find(domain)
        .await
        .ok_or_else(|| BackupError::SiteNotFound(domain.to_string()))
}

async fn list_sites_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Site>> {
    Json(state.sites.all().await)
}

async fn refresh_sites_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.sites.invalidate().await;
    let count = state.sites.all().await.len();
    info!(count, "Site list refreshed");
    Json(json!({ "success": true, "count": count }))
}

#[derive(Deserialize)]
struct CreateBackupRequest {
    #[serde(rename = "type", default)]
    kind: String,
}

async fn create_backup_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Json(request): Json<CreateBackupRequest>,
) -> ApiResult<Json<Value>> {
    let kind: BackupKind = request.kind.parse()?;
    let site = find_site(&state, &domain).await?;
    let started = state.executor.start(&site, kind).await?;
    Ok(Json(json!({
        "success": true,
        "backup_id": started.job_id,
        "message": "Backup started",
    })))
}

async fn backup_status_handler(
    State(state): State<Arc<AppState>>,
    Path((domain, backup_id)): Path<(String, String)>,
) -> Json<JobLookup> {
    // Job ids embed their domain; ids of other sites are reported unknown
    let belongs = BackupId::parse(&backup_id).is_some_and(|id| id.domain() == domain);
    if !belongs {
        return Json(JobLookup::NotFound {
            status: JobStatus::NotFound,
        });
    }
    Json(state.executor.registry().get(&backup_id))
}

async fn active_backups_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> Json<Value> {
    Json(json!(state.executor.registry().list_running_for(&domain)))
}

async fn list_backups_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<Vec<storage::BackupEntry>>> {
    let site = find_site(&state, &domain).await?;
    Ok(Json(storage::list_backups(&site.backups_dir()).await?))
}

async fn delete_backup_handler(
    State(state): State<Arc<AppState>>,
    Path((domain, folder)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let site = find_site(&state, &domain).await?;
    storage::delete_backup(&site.backups_dir(), &folder).await?;
    Ok(Json(json!({ "success": true, "message": "Backup deleted" })))
}

async fn download_backup_handler(
    State(state): State<Arc<AppState>>,
    Path((domain, folder, file)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let site = find_site(&state, &domain).await?;
    let path = resolve_artifact(&site, &format!("{}/{}", folder, file), is_artifact_name).await?;

    let handle = tokio::fs::File::open(&path).await?;
    let size = handle.metadata().await?.len();
    info!(domain = %domain, folder = %folder, file = %file, "Backup download started");

    let headers = [
        (header::CONTENT_TYPE, "application/gzip".to_string()),
        (header::CONTENT_LENGTH, size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(handle))).into_response())
}

async fn get_settings_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<ScheduleSettings>> {
    let site = find_site(&state, &domain).await?;
    Ok(Json(load_settings(&site.backups_dir()).await?))
}

async fn save_settings_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Json(settings): Json<ScheduleSettings>,
) -> ApiResult<Json<Value>> {
    let site = find_site(&state, &domain).await?;
    save_settings(&site.backups_dir(), &settings).await?;
    info!(domain = %domain, enabled = settings.enabled, "Backup settings saved");
    Ok(Json(json!({ "success": true, "settings": settings })))
}

/// Body of a restore request
///
/// `filename` is either `<folder>/<file>` or a bare file name; with a bare
/// name, `folder` picks the backup, else the newest backup holding it.
#[derive(Deserialize)]
struct RestoreRequest {
    filename: String,
    #[serde(default)]
    folder: Option<String>,
}

impl RestoreRequest {
    fn artifact(&self) -> String {
        match &self.folder {
            Some(folder) => format!("{}/{}", folder, self.filename),
            None => self.filename.clone(),
        }
    }
}

async fn restore_database_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Json<Value>> {
    let site = find_site(&state, &domain).await?;
    state.restore.restore_database(&site, &request.artifact()).await?;
    Ok(Json(json!({ "success": true, "message": "Database restored successfully" })))
}

async fn restore_files_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Json<Value>> {
    let site = find_site(&state, &domain).await?;
    state.restore.restore_files(&site, &request.artifact()).await?;
    Ok(Json(json!({ "success": true, "message": "Files restored successfully" })))
}
