//! Face detection adapter.
//!
//! The service only depends on [`FaceDetector`]; the BlazeFace ONNX model is
//! the production implementation.
use crate::config::{DetectorConfig, TensorLayout};
use crate::error::{Error, Result};
use crate::models::{Detection, FaceBox};
use crate::onnx;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use std::sync::Mutex;

/// BlazeFace model input resolution.
const INPUT_SIZE: u32 = 128;

/// Number of BlazeFace anchors (short-range model).
const NUM_ANCHORS: usize = 896;

/// Values per anchor in the regressor output: box (4) + 6 keypoints (12).
const REGRESSOR_STRIDE: usize = 16;

pub trait FaceDetector: Send + Sync {
    /// Decodes `image_bytes` and returns its dimensions plus any faces found.
    fn detect(&self, image_bytes: &[u8]) -> Result<Detection>;
}

pub fn decode_image(image_bytes: &[u8]) -> Result<DynamicImage> {
    let img = image::load_from_memory(image_bytes).map_err(|e| Error::BadImage(e.to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(Error::BadImage("image has no pixels".into()));
    }
    Ok(img)
}

pub struct BlazeFaceDetector {
    session: Mutex<Session>,
    config: DetectorConfig,
    anchors: Vec<[f32; 2]>,
}

impl BlazeFaceDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let session = onnx::build_session(&config.model_path)?;
        log::info!("Loaded face model: {}", config.model_path.display());
        Ok(Self {
            session: Mutex::new(session),
            config,
            anchors: generate_anchors(),
        })
    }

    fn run_model(&self, rgb: &RgbImage) -> Result<Vec<RawDet>> {
        let input = preprocess(rgb, INPUT_SIZE, self.config.layout);
        let input_value = ort::value::Tensor::from_array(input)
            .map_err(|e| Error::Detection(format!("Invalid detector tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Detection("face model session poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| Error::Detection(format!("Failed to run face detector: {e}")))?;

        // regressors [1, 896, 16], classificators [1, 896, 1]
        if outputs.len() < 2 {
            return Err(Error::Detection(format!(
                "BlazeFace model expected 2 outputs, got {}",
                outputs.len()
            )));
        }
        let regressors = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| Error::Detection(format!("{e}")))?;
        let scores = outputs[1]
            .try_extract_array::<f32>()
            .map_err(|e| Error::Detection(format!("{e}")))?;
        let reg_data = regressors
            .as_slice()
            .ok_or_else(|| Error::Detection("regressor output is not contiguous".into()))?;
        let score_data = scores
            .as_slice()
            .ok_or_else(|| Error::Detection("score output is not contiguous".into()))?;

        Ok(decode_raw(
            reg_data,
            score_data,
            &self.anchors,
            self.config.min_confidence,
        ))
    }
}

impl FaceDetector for BlazeFaceDetector {
    fn detect(&self, image_bytes: &[u8]) -> Result<Detection> {
        let img = decode_image(image_bytes)?;
        let (width, height) = (img.width(), img.height());

        let raw = self.run_model(&img.to_rgb8())?;
        let kept = nms(raw, self.config.nms_iou);
        let faces: Vec<FaceBox> = kept
            .iter()
            .map(|det| to_face_box(det, width, height))
            .collect();
        log::debug!("Detected {} face(s) in {}x{} image", faces.len(), width, height);

        Ok(Detection {
            width,
            height,
            faces,
        })
    }
}

/// Resize to `size × size` and normalize to [0,1] float32.
fn preprocess(img: &RgbImage, size: u32, layout: TensorLayout) -> Array4<f32> {
    let resized = image::imageops::resize(img, size, size, FilterType::Triangle);
    let s = size as usize;
    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, s, s)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, s, s, 3)),
    };
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            match layout {
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
            }
        }
    }
    tensor
}

/// Feature map side length and anchors per cell for the short-range model.
const ANCHOR_LAYERS: [(usize, usize); 2] = [(16, 2), (8, 6)];

/// Anchor centres in normalized coordinates, row-major per feature map.
fn generate_anchors() -> Vec<[f32; 2]> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    for (grid, per_cell) in ANCHOR_LAYERS {
        let cell = 1.0 / grid as f32;
        for row in 0..grid {
            for col in 0..grid {
                let centre = [(col as f32 + 0.5) * cell, (row as f32 + 0.5) * cell];
                anchors.extend(std::iter::repeat(centre).take(per_cell));
            }
        }
    }
    anchors
}

/// Candidate box in normalized [0,1] image coordinates.
#[derive(Clone, Debug)]
struct RawDet {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

fn decode_raw(
    reg_data: &[f32],
    score_data: &[f32],
    anchors: &[[f32; 2]],
    min_confidence: f32,
) -> Vec<RawDet> {
    let mut dets = Vec::new();
    for (i, (&raw_score, anchor)) in score_data.iter().zip(anchors).enumerate() {
        let score = sigmoid(raw_score);
        if score < min_confidence {
            continue;
        }
        let offset = i * REGRESSOR_STRIDE;
        if offset + 4 > reg_data.len() {
            break;
        }
        let cx = anchor[0] + reg_data[offset] / INPUT_SIZE as f32;
        let cy = anchor[1] + reg_data[offset + 1] / INPUT_SIZE as f32;
        let w = reg_data[offset + 2] / INPUT_SIZE as f32;
        let h = reg_data[offset + 3] / INPUT_SIZE as f32;
        dets.push(RawDet {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
            score,
        });
    }
    dets
}

impl RawDet {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &RawDet) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut dets: Vec<RawDet>, iou_thresh: f32) -> Vec<RawDet> {
    dets.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<RawDet> = Vec::new();
    for det in dets {
        if kept.iter().all(|k| k.iou(&det) <= iou_thresh) {
            kept.push(det);
        }
    }
    kept
}

/// Scales a normalized box to pixels, clamped to the image.
fn to_face_box(det: &RawDet, width: u32, height: u32) -> FaceBox {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    let px = |v: f32, size: u32, max: f32| (v * size as f32).clamp(0.0, max) as i64;
    FaceBox {
        x1: px(det.x1, width, max_x),
        y1: px(det.y1, height, max_y),
        x2: px(det.x2, width, max_x),
        y2: px(det.y2, height, max_y),
        score: f64::from(det.score.clamp(0.0, 1.0)),
    }
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

#[cfg(test)]
pub(crate) fn encode_test_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut buf = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageOutputFormat::Png)
        .unwrap();
    buf.into_inner()
}
