use crate::models::SharedExtractor;
use rollcall_core::{ExtractError, FaceDescriptor};
use rollcall_hw::{Camera, CameraError, Frame, FrameSource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),
    #[error("no face detected in any captured frame")]
    NoFaceDetected,
    #[error("capture worker exited")]
    ChannelClosed,
    #[error("failed to spawn capture worker: {0}")]
    Spawn(String),
    #[error("face extractor poisoned by an earlier panic")]
    ExtractorPoisoned,
}

/// Opens the capture device for a session.
pub trait CameraProvider: Send + Sync + 'static {
    /// Open `device`, or the provider's default when `None`.
    fn open(&self, device: Option<&str>) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// V4L2 devices, defaulting to the configured path.
pub struct V4lCameraProvider {
    pub device: String,
}

impl CameraProvider for V4lCameraProvider {
    fn open(&self, device: Option<&str>) -> Result<Box<dyn FrameSource>, CameraError> {
        let device = device.unwrap_or(self.device.as_str());
        let camera = Camera::open(device)?;
        tracing::info!(
            device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        Ok(Box::new(camera))
    }
}

/// Messages sent to the capture worker thread.
enum CaptureRequest {
    Extract {
        reply: oneshot::Sender<Result<Option<FaceDescriptor>, EngineError>>,
    },
    Enroll {
        frames: usize,
        reply: oneshot::Sender<Result<FaceDescriptor, EngineError>>,
    },
}

/// Clone-safe handle to a running capture worker.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<CaptureRequest>,
}

impl CaptureHandle {
    /// Grab one frame and describe the most confident face in it, if any.
    pub async fn extract(&self) -> Result<Option<FaceDescriptor>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CaptureRequest::Extract { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture up to `frames` usable frames and keep the best-detected face.
    pub async fn enroll(&self, frames: usize) -> Result<FaceDescriptor, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CaptureRequest::Enroll {
                frames,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Worker thread that owns an open camera for the length of one session.
pub struct CaptureWorker {
    handle: CaptureHandle,
    thread: std::thread::JoinHandle<()>,
}

impl CaptureWorker {
    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }

    /// Close the request channel and wait for the thread to drop the camera.
    pub async fn shutdown(self) {
        let CaptureWorker { handle, thread } = self;
        drop(handle);
        if tokio::task::spawn_blocking(move || thread.join())
            .await
            .map(|joined| joined.is_err())
            .unwrap_or(true)
        {
            tracing::warn!("capture worker panicked during shutdown");
        }
    }
}

/// Spawn the capture worker on a dedicated OS thread.
///
/// The thread exits, releasing the camera, once every [`CaptureHandle`]
/// has been dropped.
pub fn spawn_capture_worker(
    mut source: Box<dyn FrameSource>,
    extractor: SharedExtractor,
) -> Result<CaptureWorker, EngineError> {
    let (tx, mut rx) = mpsc::channel::<CaptureRequest>(4);

    let thread = std::thread::Builder::new()
        .name("rollcall-capture".into())
        .spawn(move || {
            tracing::debug!("capture worker started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    CaptureRequest::Extract { reply } => {
                        let _ = reply.send(run_extract(source.as_mut(), &extractor));
                    }
                    CaptureRequest::Enroll { frames, reply } => {
                        let _ = reply.send(run_enroll(source.as_mut(), &extractor, frames));
                    }
                }
            }
            drop(source);
            tracing::debug!("capture worker exiting");
        })
        .map_err(|e| EngineError::Spawn(e.to_string()))?;

    Ok(CaptureWorker {
        handle: CaptureHandle { tx },
        thread,
    })
}

fn describe(frame: &Frame, extractor: &SharedExtractor) -> Result<Option<FaceDescriptor>, EngineError> {
    let mut extractor = extractor
        .lock()
        .map_err(|_| EngineError::ExtractorPoisoned)?;
    Ok(extractor.extract(&frame.data, frame.width, frame.height)?)
}

fn run_extract(
    source: &mut dyn FrameSource,
    extractor: &SharedExtractor,
) -> Result<Option<FaceDescriptor>, EngineError> {
    let frame = source.capture()?;
    describe(&frame, extractor)
}

/// Capture frames and keep the descriptor with the highest detection confidence.
fn run_enroll(
    source: &mut dyn FrameSource,
    extractor: &SharedExtractor,
    frames: usize,
) -> Result<FaceDescriptor, EngineError> {
    let (captured, dark_skipped) = source.capture_burst(frames.max(1))?;
    let usable = captured.len();

    let mut best: Option<FaceDescriptor> = None;
    for frame in &captured {
        let Some(descriptor) = describe(frame, extractor)? else {
            continue;
        };
        let better = best
            .as_ref()
            .map_or(true, |b| descriptor.detection_confidence > b.detection_confidence);
        if better {
            best = Some(descriptor);
        }
    }

    tracing::debug!(usable, dark_skipped, "enroll: frames captured");

    let best = best.ok_or(EngineError::NoFaceDetected)?;
    tracing::info!(confidence = best.detection_confidence, "enroll: best face selected");
    Ok(best)
}
