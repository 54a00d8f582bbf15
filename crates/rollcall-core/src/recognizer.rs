//! 128-dimensional face descriptor network via ONNX Runtime.
//!
//! Takes a 150×150 RGB face crop and produces the descriptor used for
//! Euclidean matching. The raw output is returned unnormalized, so the
//! conventional 0.6 distance threshold applies.

use crate::crop;
use crate::types::{BoundingBox, Embedding, EMBEDDING_DIM};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const DESCRIPTOR_INPUT_SIZE: u32 = 150;
const DESCRIPTOR_SCALE: f32 = 1.0 / 255.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Descriptor network session.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the descriptor ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded face descriptor model"
        );

        Ok(Self { session })
    }

    /// Extract the descriptor of one detected face in an RGB frame.
    pub fn extract(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let crop = crop::crop_face(rgb, width, height, face, DESCRIPTOR_INPUT_SIZE)
            .ok_or(RecognizerError::EmptyCrop)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}

/// Scale a face crop to [0, 1] in NCHW order.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let (w, h) = face.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 * DESCRIPTOR_SCALE;
        }
    }
    tensor
}
