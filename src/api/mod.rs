use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

use crate::backup::{BackupType, JobDefinition, ManagerError};
use crate::remote::protocol::{JobStatusDto, ProtocolError, RemoteCommand};
use crate::storage::EventEntry;
use crate::web::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs).post(add_job))
        .route("/jobs/:name", delete(remove_job))
        .route("/command", post(run_command))
        .route("/events", get(list_events))
}

/// Body of `POST /api/jobs`; same field names as the persisted job list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewJob {
    pub name: String,
    pub source_directory: PathBuf,
    pub target_directory: PathBuf,
    #[serde(rename = "Type", default = "default_type")]
    pub backup_type: BackupType,
    #[serde(default)]
    pub encrypt_files: bool,
    #[serde(default)]
    pub extensions_to_encrypt: Vec<String>,
    #[serde(default)]
    pub blocked_processes: Vec<String>,
}

fn default_type() -> BackupType {
    BackupType::Full
}

impl NewJob {
    fn into_definition(self) -> Result<JobDefinition, ManagerError> {
        let mut definition = JobDefinition::new(
            self.name,
            self.source_directory,
            self.target_directory,
            self.backup_type,
        )?
        .with_blocked_processes(self.blocked_processes);
        if self.encrypt_files {
            definition = definition.with_encryption(self.extensions_to_encrypt);
        }
        Ok(definition)
    }
}

pub enum ApiError {
    Manager(ManagerError),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        ApiError::Manager(e)
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Manager(e) => {
                let status = match &e {
                    ManagerError::NotFound(_) => StatusCode::NOT_FOUND,
                    ManagerError::Duplicate(_) => StatusCode::CONFLICT,
                    ManagerError::Invalid(_) => StatusCode::BAD_REQUEST,
                    ManagerError::Blocked(_) | ManagerError::Job(_) => StatusCode::CONFLICT,
                };
                (status, e.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(e) => {
                tracing::error!("API request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobStatusDto>> {
    Json(state.manager.status())
}

async fn add_job(
    State(state): State<AppState>,
    Json(job): Json<NewJob>,
) -> Result<StatusCode, ApiError> {
    state.manager.add(job.into_definition()?).await?;
    Ok(StatusCode::CREATED)
}

async fn remove_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Same payload as the socket command, but the outcome is reported.
async fn run_command(
    State(state): State<AppState>,
    Json(command): Json<RemoteCommand>,
) -> Result<StatusCode, ApiError> {
    if command.command.needs_job() && command.job_name.trim().is_empty() {
        return Err(ProtocolError::MissingJobName(command.command).into());
    }
    tracing::info!("API command {} {}", command.command, command.job_name);
    state.manager.dispatch(command).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub job: Option<String>,
    pub limit: Option<i64>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<Vec<EventEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let events = state
        .manager
        .events(query.job.as_deref(), limit)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(events))
}
