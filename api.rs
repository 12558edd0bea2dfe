use crate::db::{self, DetectionStore, DEFAULT_LIMIT, TIMESTAMP_FORMAT};
use crate::detection::FaceDetector;
use crate::error::{Error, Result};
use crate::models::{DetectResponse, DetectionRecord, DetectionStats, NewDetection, RecordPage};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::Deserialize;
use serde_with::{serde_as, NoneAsEmptyString};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DetectionStore>,
    pub detector: Arc<dyn FaceDetector>,
    pub storage_timeout: Duration,
}

/// `?limit=` with no value counts as absent.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub offset: Option<i64>,
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/detect", post(detect))
        .route("/records", get(list_records))
        .route("/records/stats", get(record_stats))
        .route("/records/{id}", get(get_record))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn detect(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectResponse>> {
    let missing_field = || Error::BadRequest(format!("missing form-data field: {IMAGE_FIELD}"));
    let mut multipart = multipart.map_err(|e| {
        log::debug!("Rejected multipart request: {e}");
        missing_field()
    })?;

    let mut image_bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("Failed to parse multipart data: {e}")))?
    {
        if field.name() == Some(IMAGE_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::BadRequest(format!("Failed to read image field: {e}")))?;
            image_bytes = Some(bytes);
            break;
        }
    }
    let image_bytes = image_bytes.ok_or_else(missing_field)?;

    let detector = Arc::clone(&state.detector);
    let detection = tokio::task::spawn_blocking(move || detector.detect(&image_bytes))
        .await
        .map_err(|e| Error::Task(e.to_string()))??;

    // Persistence is best-effort: the detection is returned either way.
    // The insert is awaited to completion; the store bounds it with its own
    // checkout and busy timeouts.
    let new_record = NewDetection::from_detection(&detection);
    let store = Arc::clone(&state.store);
    let record_id = match db::run_blocking(move || store.insert(&new_record)).await {
        Ok(id) => Some(id),
        Err(e) => {
            log::warn!("Detection computed but not recorded: {e}");
            None
        }
    };

    log::info!(
        "Detected {} face(s) in {}x{} image (record {:?})",
        detection.faces.len(),
        detection.width,
        detection.height,
        record_id
    );

    Ok(Json(DetectResponse {
        count: detection.faces.len(),
        faces: detection.faces,
        record_id,
        timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
    }))
}

pub async fn list_records(
    State(state): State<AppState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<RecordPage>> {
    let Query(query) = query.map_err(|e| Error::BadRequest(e.body_text()))?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let store = Arc::clone(&state.store);
    let page =
        db::blocking_with_timeout(state.storage_timeout, move || store.list(limit, offset)).await?;
    Ok(Json(page))
}

pub async fn get_record(
    State(state): State<AppState>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> Result<Json<DetectionRecord>> {
    let Path(id) = id.map_err(|e| Error::NotFound(e.body_text()))?;

    let store = Arc::clone(&state.store);
    let record = db::blocking_with_timeout(state.storage_timeout, move || store.get(id)).await?;
    Ok(Json(record))
}

pub async fn record_stats(State(state): State<AppState>) -> Result<Json<DetectionStats>> {
    let store = Arc::clone(&state.store);
    let stats = db::blocking_with_timeout(state.storage_timeout, move || store.stats()).await?;
    Ok(Json(stats))
}
