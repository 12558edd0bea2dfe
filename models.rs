use serde::{Deserialize, Serialize};

/// One detected face in image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
    #[serde(default)]
    pub score: f64,
}

/// Output of a face detector for a single image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detection {
    pub width: u32,
    pub height: u32,
    pub faces: Vec<FaceBox>,
}

/// A detection about to be written. `id` and `timestamp` are assigned by the store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewDetection {
    pub face_count: i64,
    pub faces: Vec<FaceBox>,
    pub image_width: i64,
    pub image_height: i64,
}

impl NewDetection {
    pub fn from_detection(detection: &Detection) -> Self {
        Self {
            face_count: detection.faces.len() as i64,
            faces: detection.faces.clone(),
            image_width: i64::from(detection.width),
            image_height: i64::from(detection.height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub timestamp: String,
    pub face_count: i64,
    pub faces: Vec<FaceBox>,
    pub image_width: Option<i64>,
    pub image_height: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<DetectionRecord>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total_records: i64,
    pub total_faces_detected: i64,
    pub average_faces_per_detection: f64,
    pub last_detection_time: Option<String>,
}

impl DetectionStats {
    pub fn from_totals(
        total_records: i64,
        total_faces: i64,
        last_detection_time: Option<String>,
    ) -> Self {
        let average = if total_records > 0 {
            round_to_hundredths(total_faces as f64 / total_records as f64)
        } else {
            0.0
        };
        Self {
            total_records,
            total_faces_detected: total_faces,
            average_faces_per_detection: average,
            last_detection_time,
        }
    }
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Response body of `POST /detect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    pub faces: Vec<FaceBox>,
    pub count: usize,
    pub record_id: Option<i64>,
    pub timestamp: String,
}
