//! JSON admin API, mounted under `/admin`
//!
//! Field names are PascalCase to stay compatible with existing admin UIs.
//! Sketch data travels base64 encoded.

use super::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use espota_core::store::{ApplicationSummary, BinarySummary};
use espota_core::image::binary_file_name;
use espota_core::{DeviceIdentity, ErrorKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/device/set-app", post(set_device_app))
        .route("/apps", get(list_apps))
        .route("/apps/new", post(create_app))
        .route("/apps/set-sketch", post(set_active_sketch))
        .route("/apps/add-sketch", post(add_sketches))
}

/// Body of every admin status reply
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusBody {
    pub status: u16,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Core(espota_core::Error),
    Internal(String),
}

impl From<espota_core::Error> for ApiError {
    fn from(e: espota_core::Error) -> Self {
        ApiError::Core(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Core(e) => {
                let status = match e.kind() {
                    ErrorKind::Validation | ErrorKind::Format | ErrorKind::NotFound => {
                        StatusCode::BAD_REQUEST
                    }
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::Storage => {
                        error!("Admin request failed: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ApiError::Internal(message) => {
                error!("Admin request failed: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };

        let body = StatusBody {
            status: status.as_u16(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn ok() -> Json<StatusBody> {
    Json(StatusBody {
        status: 200,
        message: "OK".to_string(),
    })
}

/// Run store I/O off the async workers
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> espota_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("Admin worker failed: {}", e)))?
        .map_err(ApiError::from)
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceEntry {
    pub name: String,
    /// Empty when unassigned
    pub app_name: String,
    /// Latest metadata, `null` if the device never checked in
    pub info: Value,
}

async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<DeviceEntry>>> {
    let store = state.store.clone();
    let audit = state.audit.clone();

    let entries = blocking(move || {
        let devices = store.list_devices()?;
        Ok(devices
            .into_iter()
            .map(|device| {
                let info = match audit.device_info(&device.identity) {
                    Ok(Some(info)) => serde_json::to_value(info).unwrap_or(Value::Null),
                    Ok(None) => Value::Null,
                    Err(e) => {
                        warn!("Reading info of {} failed: {}", device.identity, e);
                        serde_json::json!({ "err": e.to_string() })
                    }
                };
                DeviceEntry {
                    name: device.identity.to_string(),
                    app_name: device.application.unwrap_or_default(),
                    info,
                }
            })
            .collect::<Vec<_>>())
    })
    .await?;

    Ok(Json(entries))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DeviceRequest {
    name: String,
    app_name: String,
}

async fn set_device_app(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<StatusBody>> {
    let request: DeviceRequest = parse_body(&body)?;
    if request.name.is_empty() || request.app_name.is_empty() {
        return Err(ApiError::BadRequest("Missing parameter `Name` or `AppName`".to_string()));
    }

    let device = DeviceIdentity::parse(&request.name)?;
    let store = state.store.clone();
    let application = request.app_name;
    blocking(move || store.set_device_application(&device, &application)).await?;

    Ok(ok())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SketchEntry {
    pub name: String,
    pub size: u64,
    pub mod_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppEntry {
    pub name: String,
    /// Empty when no binary is active
    pub active_sketch: String,
    pub sketches: Vec<SketchEntry>,
}

impl From<ApplicationSummary> for AppEntry {
    fn from(summary: ApplicationSummary) -> Self {
        Self {
            name: summary.name,
            active_sketch: summary.active.unwrap_or_default(),
            sketches: summary.binaries.into_iter().map(SketchEntry::from).collect(),
        }
    }
}

impl From<BinarySummary> for SketchEntry {
    fn from(summary: BinarySummary) -> Self {
        Self {
            name: summary.name,
            size: summary.size,
            mod_time: summary.modified,
        }
    }
}

async fn list_apps(State(state): State<AppState>) -> ApiResult<Json<Vec<AppEntry>>> {
    let store = state.store.clone();
    let apps = blocking(move || store.list_applications()).await?;
    Ok(Json(apps.into_iter().map(AppEntry::from).collect()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SketchUpload {
    name: String,
    /// base64
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct AppRequest {
    name: String,
    active_sketch: String,
    sketches: Vec<SketchUpload>,
}

async fn create_app(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<StatusBody>> {
    let request: AppRequest = parse_body(&body)?;
    if request.name.is_empty() {
        return Err(ApiError::BadRequest("Missing parameter `Name` or `ActiveSketch`".to_string()));
    }

    let store = state.store.clone();
    let name = request.name;
    blocking(move || store.create_application(&name)).await?;

    Ok(ok())
}

async fn set_active_sketch(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<StatusBody>> {
    let request: AppRequest = parse_body(&body)?;
    if request.name.is_empty() || request.active_sketch.is_empty() {
        return Err(ApiError::BadRequest("Missing parameter `Name` or `ActiveSketch`".to_string()));
    }

    let store = state.store.clone();
    let AppRequest {
        name, active_sketch, ..
    } = request;
    blocking(move || store.set_active_binary(&name, &active_sketch)).await?;

    Ok(ok())
}

async fn add_sketches(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<StatusBody>> {
    let request: AppRequest = parse_body(&body)?;
    let incomplete = request.name.is_empty()
        || request.sketches.is_empty()
        || request
            .sketches
            .iter()
            .any(|sketch| sketch.name.is_empty() || sketch.data.is_empty());
    if incomplete {
        return Err(ApiError::BadRequest("Missing parameter `Name` or `Sketches`".to_string()));
    }

    // Decode and check everything before touching the store
    let check = state.store.image_check();
    let mut uploads = Vec::with_capacity(request.sketches.len());
    for sketch in request.sketches {
        let data = base64::engine::general_purpose::STANDARD
            .decode(sketch.data.as_bytes())
            .map_err(|e| {
                ApiError::BadRequest(format!("Invalid base64 in `Data` of {}: {}", sketch.name, e))
            })?;
        binary_file_name(&sketch.name)?;
        check.validate(&data)?;
        uploads.push((sketch.name, data));
    }

    let store = state.store.clone();
    let application = request.name;
    let stored = blocking(move || {
        uploads
            .iter()
            .map(|(name, data)| store.upload_binary(&application, name, data))
            .collect::<espota_core::Result<Vec<_>>>()
    })
    .await?;
    info!("Admin upload stored {}", stored.join(", "));

    Ok(ok())
}
