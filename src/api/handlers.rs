//! Request handlers for the studio UI

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::client::traits::ClientConfig;
use crate::client::types::{
    ApiVersion, GeneratedImage, GenerationRequest, ImageSize, Quality, Style, AS_IS_PREFIX,
};
use crate::config::{positive_count, GenerationDefaults, Settings};
use crate::error::{AppError, ErrorDetail, Result};
use crate::queue::{DispatcherStats, JobState};
use crate::response::file::mime_for;
use crate::session::Session;
use crate::{AppState, JobRecord};

/// Longest accepted long-poll
const MAX_WAIT_SECS: u64 = 60;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
pub struct SettingsView {
    pub connection: ConnectionView,
    pub generation: GenerationDefaults,
    pub save_dir: String,
    pub options: OptionsView,
    pub as_is_prefix: &'static str,
}

#[derive(Serialize)]
pub struct ConnectionView {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: ApiVersion,
    pub rpm: u32,
    pub has_key: bool,
}

#[derive(Serialize)]
pub struct OptionsView {
    pub api_version: Vec<&'static str>,
    pub style: Vec<&'static str>,
    pub quality: Vec<&'static str>,
    pub size: Vec<&'static str>,
}

/// Prefill values and allowed options for both forms
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsView> {
    let s = &state.settings;
    Json(SettingsView {
        connection: ConnectionView {
            endpoint: s.connection.endpoint.clone(),
            deployment: s.connection.deployment.clone(),
            api_version: s.connection.api_version,
            rpm: s.connection.rpm,
            has_key: !s.connection.key.is_empty(),
        },
        generation: s.generation.clone(),
        save_dir: s.save_dir.display().to_string(),
        options: OptionsView {
            api_version: ApiVersion::options(),
            style: Style::options(),
            quality: Quality::options(),
            size: ImageSize::options(),
        },
        as_is_prefix: AS_IS_PREFIX,
    })
}

#[derive(Debug, Deserialize)]
pub struct SessionBody {
    /// Falls back to the key from the settings file
    #[serde(default)]
    pub key: Option<String>,
    pub endpoint: String,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub rpm: Option<f64>,
}

#[derive(Serialize)]
pub struct SessionView {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<ApiVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DispatcherStats>,
}

impl SessionView {
    fn disconnected() -> Self {
        Self {
            connected: false,
            id: None,
            endpoint: None,
            deployment: None,
            api_version: None,
            opened_at: None,
            stats: None,
        }
    }

    fn from_session(session: &Session) -> Self {
        let config = session.client_config();
        Self {
            connected: true,
            id: Some(session.id()),
            endpoint: config.map(|c| c.endpoint.clone()),
            deployment: config.map(|c| c.deployment.clone()),
            api_version: config.map(|c| c.api_version),
            opened_at: Some(session.opened_at()),
            stats: Some(session.dispatcher().stats()),
        }
    }
}

/// Connection form: build a new client and dispatcher
pub async fn open_session(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<SessionBody>, JsonRejection>,
) -> Result<Json<SessionView>> {
    let Json(body) = payload.map_err(|e| AppError::Configuration(e.body_text()))?;
    let defaults = &state.settings.connection;

    let api_version = match body.api_version.as_deref() {
        Some(raw) => raw.parse::<ApiVersion>().map_err(|_| {
            AppError::Configuration(format!("Unsupported api_version '{}'", raw))
        })?,
        None => defaults.api_version,
    };
    let rpm = match body.rpm {
        Some(rpm) => positive_count(rpm).ok_or_else(|| {
            AppError::Configuration("RPM must be a positive integer".to_string())
        })?,
        None => defaults.rpm,
    };

    let client_config = ClientConfig {
        key: body
            .key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| defaults.key.clone()),
        endpoint: body.endpoint,
        deployment: body
            .deployment
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| defaults.deployment.clone()),
        api_version,
    };

    let session = state.connect(client_config, rpm)?;
    info!(
        deployment = session.client_config().map(|c| c.deployment.as_str()).unwrap_or(""),
        rpm,
        "Client created"
    );
    Ok(Json(SessionView::from_session(&session)))
}

pub async fn session_status(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    let view = match state.current_session() {
        Ok(session) => SessionView::from_session(&session),
        Err(_) => SessionView::disconnected(),
    };
    Json(view)
}

pub async fn close_session(State(state): State<Arc<AppState>>) -> Result<StatusCode> {
    if state.close_session() {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NoSession)
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    /// Fractional values are truncated
    #[serde(default)]
    pub num: Option<f64>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub as_is: Option<bool>,
}

impl GenerateBody {
    /// Fill unset fields from the defaults and check the rest
    fn into_request(self, settings: &Settings) -> Result<GenerationRequest> {
        let mut request = settings.request_template(self.prompt);

        if let Some(num) = self.num {
            request.num = positive_count(num)
                .ok_or_else(|| AppError::Validation("Num must be a positive integer".to_string()))?;
        }
        if let Some(style) = self.style {
            request.style = style.parse()?;
        }
        if let Some(quality) = self.quality {
            request.quality = quality.parse()?;
        }
        if let Some(size) = self.size {
            request.size = size.parse()?;
        }
        if let Some(as_is) = self.as_is {
            request.as_is = as_is;
        }

        request.validate()?;
        Ok(request)
    }
}

#[derive(Serialize)]
pub struct GenerateView {
    pub jobs: Vec<JobView>,
}

/// Generation form: submit one job per requested image
pub async fn generate(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<GenerateBody>, JsonRejection>,
) -> Result<(StatusCode, Json<GenerateView>)> {
    let Json(body) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let request = body.into_request(&state.settings)?;
    let records = state.submit(request)?;

    let jobs = records.iter().map(JobView::from_record).collect();
    Ok((StatusCode::ACCEPTED, Json(GenerateView { jobs })))
}

#[derive(Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub state: &'static str,
    pub prompt: String,
    pub as_is: bool,
    pub submitted_at: DateTime<Utc>,
    pub images: Vec<ImageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

#[derive(Serialize)]
pub struct ImageView {
    pub index: usize,
    pub url: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

impl JobView {
    fn from_record(record: &JobRecord) -> Self {
        Self::with_state(record, record.handle.state())
    }

    fn with_state(record: &JobRecord, state: JobState) -> Self {
        let id = record.handle.id();
        let request = record.handle.request();

        let (images, error) = match &state {
            JobState::Succeeded(images) => (
                images
                    .iter()
                    .enumerate()
                    .map(|(index, image)| ImageView {
                        index,
                        url: format!("/api/jobs/{}/images/{}", id, index),
                        content_type: content_type(image),
                        revised_prompt: image.revised_prompt.clone(),
                    })
                    .collect(),
                None,
            ),
            JobState::Failed(error) => (Vec::new(), Some(error.detail())),
            _ => (Vec::new(), None),
        };

        Self {
            id,
            state: state.label(),
            prompt: request.prompt.clone(),
            as_is: request.as_is,
            submitted_at: record.handle.submitted_at(),
            images,
            error,
        }
    }
}

fn content_type(image: &GeneratedImage) -> String {
    image
        .content_type
        .clone()
        .filter(|ct| ct.starts_with("image/"))
        .unwrap_or_else(|| mime_for(&image.data).to_string())
}

/// All known jobs, newest first
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobView>> {
    let mut records: Vec<JobRecord> = state.jobs.iter().map(|e| e.value().clone()).collect();
    records.sort_by(|a, b| b.stamp.cmp(&a.stamp));
    Json(records.iter().map(JobView::from_record).collect())
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    pub wait_secs: Option<u64>,
}

/// Poll a job; `wait_secs` long-polls until it is terminal
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<JobView>> {
    let record = state.job(id)?;

    let job_state = match query.wait_secs.filter(|s| *s > 0) {
        Some(secs) => {
            let wait = Duration::from_secs(secs.min(MAX_WAIT_SECS));
            tokio::time::timeout(wait, record.handle.wait())
                .await
                .unwrap_or_else(|_| record.handle.state())
        }
        None => record.handle.state(),
    };

    Ok(Json(JobView::with_state(&record, job_state)))
}

/// Cancel a queued job, or forget a finished one
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>> {
    let record = state.job(id)?;

    if record.handle.cancel() {
        info!(job_id = %id, "Job cancelled");
        return Ok(Json(JobView::from_record(&record)));
    }

    let job_state = record.handle.state();
    if job_state.is_terminal() {
        state.jobs.remove(&id);
        return Ok(Json(JobView::with_state(&record, job_state)));
    }

    Err(AppError::InvalidState(format!(
        "Job {} is already {} and cannot be cancelled",
        id,
        job_state.label()
    )))
}

fn find_image(record: &JobRecord, index: usize) -> Result<GeneratedImage> {
    match record.handle.state() {
        JobState::Succeeded(images) => images.get(index).cloned().ok_or_else(|| {
            AppError::JobNotFound(format!("{} has no image {}", record.handle.id(), index))
        }),
        other => Err(AppError::InvalidState(format!(
            "Job {} is {}, no images available",
            record.handle.id(),
            other.label()
        ))),
    }
}

/// Raw image bytes for display
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(Uuid, usize)>,
) -> Result<Response> {
    let record = state.job(id)?;
    let image = find_image(&record, index)?;

    Ok(([(header::CONTENT_TYPE, content_type(&image))], image.data).into_response())
}

#[derive(Serialize)]
pub struct SavedView {
    pub path: String,
}

/// Save action on an image card
pub async fn save_image(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(Uuid, usize)>,
) -> Result<Json<SavedView>> {
    let record = state.job(id)?;
    let image = find_image(&record, index)?;

    let path = state
        .store
        .save(&record.handle.request().prompt, &record.stamp.to_string(), &image)
        .await?;

    info!(job_id = %id, path = %path.display(), "Saved image");
    Ok(Json(SavedView {
        path: path.display().to_string(),
    }))
}
