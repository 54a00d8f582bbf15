//! Lightweight single-shot face detector via ONNX Runtime.
//!
//! Expects an UltraFace-style export: a 320×240 RGB input and two outputs,
//! `scores` shaped [1, N, 2] (background, face) and `boxes` shaped [1, N, 4]
//! holding normalized corner coordinates.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_CONFIDENCE_THRESHOLD: f32 = 0.7;
const DETECTOR_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer does not match {width}x{height} RGB")]
    BadFrame { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detector session.
pub struct FaceDetector {
    session: Session,
    /// Output indices (scores, boxes), discovered by name at load time.
    outputs: (usize, usize),
}

impl FaceDetector {
    /// Load the detector ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector requires scores and boxes outputs, got {}",
                output_names.len()
            )));
        }
        let outputs = discover_outputs(&output_names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded face detector"
        );

        Ok(Self { session, outputs })
    }

    /// Detect faces in an RGB frame, returning boxes sorted by descending confidence.
    pub fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = preprocess(rgb, width, height)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (scores_idx, boxes_idx) = self.outputs;
        let (_, scores) = outputs[scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(scores, boxes, width, height, DETECTOR_CONFIDENCE_THRESHOLD);
        Ok(nms(candidates, DETECTOR_NMS_THRESHOLD))
    }
}

/// Resize to the detector input and normalize into a NCHW tensor.
fn preprocess(rgb: &[u8], width: u32, height: u32) -> Result<Array4<f32>, DetectorError> {
    let image = RgbImage::from_raw(width, height, rgb.to_vec())
        .ok_or(DetectorError::BadFrame { width, height })?;
    let resized = imageops::resize(
        &image,
        DETECTOR_INPUT_WIDTH,
        DETECTOR_INPUT_HEIGHT,
        FilterType::Triangle,
    );

    let (w, h) = (DETECTOR_INPUT_WIDTH as usize, DETECTOR_INPUT_HEIGHT as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
        }
    }
    Ok(tensor)
}

/// Map output names to (scores, boxes) indices, falling back to positional order.
fn discover_outputs(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(?names, "detector output names not recognized, using [0]=scores, [1]=boxes");
            (0, 1)
        }
    }
}

/// Turn raw prior scores and normalized corners into frame-space boxes.
fn decode(scores: &[f32], boxes: &[f32], width: u32, height: u32, threshold: f32) -> Vec<BoundingBox> {
    let priors = (scores.len() / 2).min(boxes.len() / 4);
    let (fw, fh) = (width as f32, height as f32);

    (0..priors)
        .filter_map(|i| {
            let confidence = scores[i * 2 + 1];
            if confidence <= threshold {
                return None;
            }
            let x1 = boxes[i * 4].clamp(0.0, 1.0) * fw;
            let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * fh;
            let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * fw;
            let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * fh;
            if x2 <= x1 || y2 <= y1 {
                return None;
            }
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence,
            })
        })
        .collect()
}

/// Non-Maximum Suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
