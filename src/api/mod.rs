use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backup::manager::RunStatus;
use crate::backup::{BackupManager, Job};
use crate::storage::StorageError;
use crate::utils::LogEntry;

mod error;

pub use error::ApiError;

pub fn routes() -> Router<BackupManager> {
    Router::new()
        .route("/status", get(get_status))
        .route("/profiles", get(list_profiles).post(add_profile))
        .route("/profiles/reload", post(reload_profiles))
        .route("/profiles/:index", put(update_profile).delete(remove_profile))
        .route("/profiles/:index/duplicate", post(duplicate_profile))
        .route("/profiles/:index/rename", post(rename_profile))
        .route("/profiles/:index/preview", get(preview_profile))
        .route("/profiles/:index/run", post(run_profile))
        .route("/run-all", post(run_all))
        .route("/stop", post(stop))
        .route("/logs", get(get_logs).delete(clear_logs))
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Serialize)]
struct IndexResponse {
    index: usize,
}

#[derive(Serialize)]
struct PreviewResponse {
    command: String,
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn get_status(State(manager): State<BackupManager>) -> Json<RunStatus> {
    Json(manager.get_status())
}

async fn list_profiles(State(manager): State<BackupManager>) -> Json<Vec<Job>> {
    Json(manager.profiles().list())
}

async fn add_profile(
    State(manager): State<BackupManager>,
    Json(request): Json<NameRequest>,
) -> Result<(StatusCode, Json<IndexResponse>), ApiError> {
    let index = manager.profiles().add(&request.name)?;
    Ok((StatusCode::CREATED, Json(IndexResponse { index })))
}

async fn update_profile(
    State(manager): State<BackupManager>,
    Path(index): Path<usize>,
    Json(job): Json<Job>,
) -> Result<StatusCode, ApiError> {
    if job.name.trim().is_empty() {
        return Err(StorageError::EmptyName.into());
    }
    manager.profiles().update(index, job)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_profile(
    State(manager): State<BackupManager>,
    Path(index): Path<usize>,
) -> Result<Json<Job>, ApiError> {
    let removed = manager.profiles().remove(index)?;
    Ok(Json(removed))
}

async fn duplicate_profile(
    State(manager): State<BackupManager>,
    Path(index): Path<usize>,
) -> Result<(StatusCode, Json<IndexResponse>), ApiError> {
    let index = manager.profiles().duplicate(index)?;
    Ok((StatusCode::CREATED, Json(IndexResponse { index })))
}

async fn rename_profile(
    State(manager): State<BackupManager>,
    Path(index): Path<usize>,
    Json(request): Json<NameRequest>,
) -> Result<StatusCode, ApiError> {
    manager.profiles().rename(index, &request.name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reload_profiles(
    State(manager): State<BackupManager>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = manager.reload_profiles()?;
    Ok(Json(json!({ "profiles": count })))
}

async fn preview_profile(
    State(manager): State<BackupManager>,
    Path(index): Path<usize>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let command = manager.preview(index)?;
    Ok(Json(PreviewResponse { command }))
}

async fn run_profile(
    State(manager): State<BackupManager>,
    Path(index): Path<usize>,
) -> Result<StatusCode, ApiError> {
    manager.run_profile(index)?;
    Ok(StatusCode::ACCEPTED)
}

async fn run_all(
    State(manager): State<BackupManager>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let queued = manager.run_all()?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))))
}

async fn stop(State(manager): State<BackupManager>) -> impl IntoResponse {
    manager.stop();
    StatusCode::ACCEPTED
}

async fn get_logs(
    State(manager): State<BackupManager>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogEntry>> {
    Json(manager.get_logs(query.limit))
}

async fn clear_logs(State(manager): State<BackupManager>) -> StatusCode {
    manager.clear_logs();
    StatusCode::NO_CONTENT
}
