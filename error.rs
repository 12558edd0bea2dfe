use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database Pool Error: {0}")]
    DbPool(#[from] r2d2::Error),

    #[error("Database Error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("Bad Image: {0}")]
    BadImage(String),

    #[error("Record {0} not found")]
    NotFound(String),

    #[error("Storage Init Error at {}: {message}", .path.display())]
    StorageInit { path: PathBuf, message: String },

    #[error("Storage Write Error: {0}")]
    StorageWrite(String),

    #[error("Storage call timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("Invalid Record: {0}")]
    InvalidRecord(String),

    #[error("Detection Error: {0}")]
    Detection(String),

    #[error("Task join error: {0}")]
    Task(String),

    #[error("Initialization Failed: {0}")]
    Init(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::BadImage(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::StorageTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message returned to HTTP clients.
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest(message) => message.clone(),
            Error::BadImage(_) => "bad image".to_string(),
            Error::NotFound(_) => "Record not found".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::BadRequest(_) | Error::BadImage(_) | Error::NotFound(_) => {
                log::debug!("Client error: {}", self);
            }
            Error::StorageTimeout(_) => {
                log::warn!("Storage timeout: {}", self);
            }
            _ => {
                log::error!("Internal service error: {}", self);
            }
        }

        let status = self.status_code();
        let body = serde_json::json!({ "error": self.user_message() });
        (status, Json(body)).into_response()
    }
}
