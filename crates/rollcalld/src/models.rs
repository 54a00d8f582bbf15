//! One-time loading of the face pipeline, shared by every capture session.

use rollcall_core::{DescriptorExtractor, ExtractError, FacePipeline};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Loaded extractor; locked by the capture worker for each frame.
pub type SharedExtractor = Arc<Mutex<Box<dyn DescriptorExtractor>>>;

type Loader = Arc<dyn Fn() -> Result<Box<dyn DescriptorExtractor>, ExtractError> + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum ModelLoadError {
    #[error("failed to load face models: {0}")]
    Failed(String),
    #[error("model loading task panicked")]
    Panicked,
}

/// Lazily loads the face pipeline exactly once.
///
/// Concurrent callers of [`ModelService::ensure_loaded`] share a single
/// in-flight load. A failed load leaves the service unloaded so the next
/// call retries.
pub struct ModelService {
    loader: Loader,
    cell: OnceCell<SharedExtractor>,
}

impl ModelService {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Box<dyn DescriptorExtractor>, ExtractError> + Send + Sync + 'static,
    {
        Self {
            loader: Arc::new(loader),
            cell: OnceCell::new(),
        }
    }

    /// ONNX pipeline loaded from `model_dir`.
    pub fn onnx(model_dir: PathBuf) -> Self {
        Self::new(move || {
            let pipeline = FacePipeline::load(&model_dir)?;
            Ok(Box::new(pipeline) as Box<dyn DescriptorExtractor>)
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn ensure_loaded(&self) -> Result<SharedExtractor, ModelLoadError> {
        self.cell
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                let started = std::time::Instant::now();
                let extractor = tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|_| ModelLoadError::Panicked)?
                    .map_err(|e| {
                        tracing::error!(error = %e, "face model load failed");
                        ModelLoadError::Failed(e.to_string())
                    })?;
                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "face models loaded");
                Ok(Arc::new(Mutex::new(extractor)))
            })
            .await
            .cloned()
    }
}
