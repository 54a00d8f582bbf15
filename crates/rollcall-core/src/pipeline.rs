//! Frame → descriptor pipeline: detect the best face, crop it, describe it.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "face_detector.onnx";
pub const DESCRIPTOR_MODEL_FILE: &str = "face_descriptor.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Descriptor of the face found in one frame.
#[derive(Debug, Clone)]
pub struct FaceDescriptor {
    pub embedding: Embedding,
    /// Detection confidence of the face the descriptor came from.
    pub detection_confidence: f32,
}

/// Anything that turns an RGB frame into at most one face descriptor.
///
/// `Ok(None)` means no face was found; that is an ordinary outcome, not an error.
pub trait DescriptorExtractor: Send {
    fn extract(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceDescriptor>, ExtractError>;
}

/// Paths of the two ONNX models under a model directory.
pub fn model_paths(model_dir: &Path) -> (PathBuf, PathBuf) {
    (
        model_dir.join(DETECTOR_MODEL_FILE),
        model_dir.join(DESCRIPTOR_MODEL_FILE),
    )
}

/// ONNX-backed detector + descriptor pipeline.
pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FacePipeline {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let (detector_path, descriptor_path) = model_paths(model_dir);
        let detector = FaceDetector::load(&detector_path)?;
        let recognizer = FaceRecognizer::load(&descriptor_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl DescriptorExtractor for FacePipeline {
    fn extract(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceDescriptor>, ExtractError> {
        let faces = self.detector.detect(rgb, width, height)?;
        // Sorted by confidence; only the best face is described.
        let Some(face) = faces.first() else {
            return Ok(None);
        };
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), "multiple faces in frame; using the most confident");
        }

        let embedding = self.recognizer.extract(rgb, width, height, face)?;
        Ok(Some(FaceDescriptor {
            embedding,
            detection_confidence: face.confidence,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_paths() {
        let (det, desc) = model_paths(Path::new("/opt/rollcall/models"));
        assert_eq!(det, Path::new("/opt/rollcall/models/face_detector.onnx"));
        assert_eq!(desc, Path::new("/opt/rollcall/models/face_descriptor.onnx"));
    }

    #[test]
    fn test_load_fails_without_models() {
        let err = FacePipeline::load(Path::new("/nonexistent/models")).err().unwrap();
        assert!(matches!(err, ExtractError::Detector(DetectorError::ModelNotFound(_))));
    }
}
