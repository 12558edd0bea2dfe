use crate::error::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub pool_size: u32,
    pub timeout_ms: u64,
    pub max_page_size: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/data/face_detection.db"),
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl StorageConfig {
    /// Config for a store rooted at `db_path` with default tuning.
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_pool_size() -> u32 {
    8
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_page_size() -> i64 {
    1_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nchw" => Ok(Self::Nchw),
            "nhwc" => Ok(Self::Nhwc),
            other => Err(format!("unknown tensor layout '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub min_confidence: f32,
    pub nms_iou: f32,
    pub layout: TensorLayout,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/blazeface.onnx"),
            min_confidence: default_min_confidence(),
            nms_iou: default_nms_iou(),
            layout: default_layout(),
        }
    }
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_nms_iou() -> f32 {
    0.3
}

fn default_layout() -> TensorLayout {
    TensorLayout::Nchw
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub detector: DetectorConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            settings.server.bind_addr = addr;
        }
        override_parsed(&lookup, "MAX_UPLOAD_BYTES", &mut settings.server.max_upload_bytes)?;

        if let Some(path) = lookup("DB_PATH") {
            settings.storage.db_path = PathBuf::from(path);
        }
        override_parsed(&lookup, "DB_POOL_SIZE", &mut settings.storage.pool_size)?;
        override_parsed(&lookup, "STORAGE_TIMEOUT_MS", &mut settings.storage.timeout_ms)?;
        override_parsed(&lookup, "MAX_PAGE_SIZE", &mut settings.storage.max_page_size)?;

        if let Some(path) = lookup("FACE_MODEL_PATH") {
            settings.detector.model_path = PathBuf::from(path);
        }
        override_parsed(&lookup, "FACE_MIN_CONFIDENCE", &mut settings.detector.min_confidence)?;
        override_parsed(&lookup, "FACE_NMS_IOU", &mut settings.detector.nms_iou)?;
        override_parsed(&lookup, "FACE_MODEL_LAYOUT", &mut settings.detector.layout)?;

        if settings.storage.pool_size == 0 {
            return Err(Error::Init("DB_POOL_SIZE must be at least 1".into()));
        }
        if settings.storage.max_page_size < 1 {
            return Err(Error::Init("MAX_PAGE_SIZE must be at least 1".into()));
        }
        Ok(settings)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| Error::Init(format!("Invalid {key}='{raw}': {e}")))?;
    }
    Ok(())
}
