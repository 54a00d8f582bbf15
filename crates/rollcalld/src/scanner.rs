//! Scan sessions: periodic capture, match and attendance marking for one scope.

use crate::attendance::{AttendanceRecord, AttendanceSink};
use crate::engine::{spawn_capture_worker, CameraProvider, CaptureHandle, CaptureWorker, EngineError};
use crate::gate::{CooldownGate, MarkOutcome, SuppressReason};
use crate::models::{ModelLoadError, ModelService};
use crate::store::{FaceStore, Scope, ScopeInfo, StoreError};
use chrono::Utc;
use rollcall_core::{EuclideanMatcher, Identity, MatchResult, Matcher};
use rollcall_hw::{CameraError, FrameSource};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("no scope selected")]
    NoScopeSelected,
    #[error("unknown scope: {0}")]
    UnknownScope(String),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("{0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("capture error: {0}")]
    Engine(EngineError),
    #[error("no face detected in any captured frame")]
    NoFaceDetected,
    #[error("camera is in use by an active scan session")]
    CameraBusy,
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<EngineError> for ScanError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NoFaceDetected => ScanError::NoFaceDetected,
            EngineError::Camera(e) => ScanError::Camera(e),
            other => ScanError::Engine(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    CameraStarting,
    Scanning,
}

/// Operator-facing view of the scanner.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    pub state: ScanState,
    pub scope: Option<ScopeInfo>,
    pub candidates: usize,
    pub current_match: Option<MatchResult>,
    pub status: String,
}

impl ScanSnapshot {
    fn idle(status: impl Into<String>) -> Self {
        Self {
            state: ScanState::Idle,
            scope: None,
            candidates: 0,
            current_match: None,
            status: status.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Started { scope: ScopeInfo, candidates: usize },
    NoEnrolledFaces { scope: ScopeInfo },
    Matched { result: MatchResult },
    Marked { record: AttendanceRecord },
    Suppressed { student_id: String, reason: SuppressReason },
    WriteFailed { student_id: String, reason: String },
    ExtractFailed { reason: String },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Scanning { candidates: usize },
    NoEnrolledFaces,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub threshold: f32,
    pub interval: Duration,
    pub cooldown: chrono::Duration,
    pub write_timeout: Duration,
    pub frames_per_enroll: usize,
}

/// Resources held by one running scan session.
struct Session {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    worker: Option<CaptureWorker>,
}

impl Session {
    async fn close(mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

pub struct Scanner<A: AttendanceSink> {
    settings: ScanSettings,
    store: FaceStore,
    sink: Arc<A>,
    models: Arc<ModelService>,
    cameras: Arc<dyn CameraProvider>,
    session: Mutex<Option<Session>>,
    snapshot: Arc<watch::Sender<ScanSnapshot>>,
    events: broadcast::Sender<ScanEvent>,
}

impl<A: AttendanceSink> Scanner<A> {
    pub fn new(
        settings: ScanSettings,
        store: FaceStore,
        sink: Arc<A>,
        models: Arc<ModelService>,
        cameras: Arc<dyn CameraProvider>,
    ) -> Self {
        let (snapshot, _) = watch::channel(ScanSnapshot::idle("Idle"));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            store,
            sink,
            models,
            cameras,
            session: Mutex::new(None),
            snapshot: Arc::new(snapshot),
            events,
        }
    }

    pub fn store(&self) -> &FaceStore {
        &self.store
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn models_loaded(&self) -> bool {
        self.models.is_loaded()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Start scanning `scope_id`, stopping any session already running.
    ///
    /// `device` picks the camera; `None` uses the provider's default.
    pub async fn start(
        &self,
        scope_id: Option<&str>,
        device: Option<&str>,
    ) -> Result<StartOutcome, ScanError> {
        let scope_id = match scope_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                // A running session keeps its own status.
                if self.session.lock().await.is_none() {
                    self.snapshot
                        .send_replace(ScanSnapshot::idle("Select a scope to start scanning"));
                }
                return Err(ScanError::NoScopeSelected);
            }
        };
        let device = selected_device(device);

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.close().await;
            tracing::info!("previous scan session stopped");
            let _ = self.events.send(ScanEvent::Stopped);
        }

        self.snapshot.send_replace(ScanSnapshot {
            state: ScanState::CameraStarting,
            status: "Starting camera...".into(),
            ..ScanSnapshot::idle("")
        });

        match self.open_session(&scope_id, device).await {
            Ok((opened, outcome)) => {
                *session = Some(opened);
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(scope = %scope_id, error = %e, "scan start failed");
                let status = match &e {
                    ScanError::Camera(camera) => camera.user_message().to_string(),
                    other => other.to_string(),
                };
                self.snapshot.send_replace(ScanSnapshot::idle(status));
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        scope_id: &str,
        device: Option<String>,
    ) -> Result<(Session, StartOutcome), ScanError> {
        let extractor = self.models.ensure_loaded().await?;
        let scope = self
            .store
            .get_scope(scope_id)
            .await?
            .ok_or_else(|| ScanError::UnknownScope(scope_id.to_string()))?;

        let source = self.open_camera(device).await?;
        let worker = spawn_capture_worker(source, extractor)?;

        let candidates = match self.store.fetch_candidates(&Scope::from_id(&scope.id)).await {
            Ok(candidates) => candidates,
            Err(e) => {
                worker.shutdown().await;
                return Err(e.into());
            }
        };

        let active = Arc::new(AtomicBool::new(true));

        if candidates.is_empty() {
            tracing::warn!(scope = %scope.id, "no enrolled faces in scope; scanning not started");
            self.snapshot.send_modify(|s| {
                s.scope = Some(scope.clone());
                s.candidates = 0;
                s.status = "No enrolled faces in this scope".into();
            });
            let _ = self.events.send(ScanEvent::NoEnrolledFaces { scope });
            let session = Session {
                active,
                task: None,
                worker: Some(worker),
            };
            return Ok((session, StartOutcome::NoEnrolledFaces));
        }

        let count = candidates.len();
        let tick = ScanTick {
            handle: worker.handle(),
            candidates,
            subject: scope.name.clone(),
            threshold: self.settings.threshold,
            gate: CooldownGate::new(self.settings.cooldown, self.settings.write_timeout),
            sink: Arc::clone(&self.sink),
            active: Arc::clone(&active),
            snapshot: Arc::clone(&self.snapshot),
            events: self.events.clone(),
        };

        self.snapshot.send_replace(ScanSnapshot {
            state: ScanState::Scanning,
            scope: Some(scope.clone()),
            candidates: count,
            current_match: None,
            status: "Scanning...".into(),
        });
        let task = tokio::spawn(run_scan_loop(tick, self.settings.interval));

        tracing::info!(scope = %scope.id, subject = %scope.name, candidates = count, "scan started");
        let _ = self.events.send(ScanEvent::Started {
            scope,
            candidates: count,
        });

        let session = Session {
            active,
            task: Some(task),
            worker: Some(worker),
        };
        Ok((session, StartOutcome::Scanning { candidates: count }))
    }

    async fn open_camera(&self, device: Option<String>) -> Result<Box<dyn FrameSource>, ScanError> {
        let cameras = Arc::clone(&self.cameras);
        let source = tokio::task::spawn_blocking(move || cameras.open(device.as_deref()))
            .await
            .map_err(|e| ScanError::Task(e.to_string()))??;
        Ok(source)
    }

    /// Stop the running session and release the camera. No-op when idle.
    pub async fn stop(&self) {
        let previous = self.session.lock().await.take();
        let Some(previous) = previous else {
            return;
        };
        previous.close().await;
        self.snapshot.send_replace(ScanSnapshot::idle("Stopped"));
        tracing::info!("scan stopped");
        let _ = self.events.send(ScanEvent::Stopped);
    }

    /// Capture a face from `device` (or the default camera) and enroll it under `student_id`.
    pub async fn enroll(
        &self,
        student_id: &str,
        name: &str,
        device: Option<&str>,
    ) -> Result<Identity, ScanError> {
        let (student_id, name) = (student_id.trim(), name.trim());
        if student_id.is_empty() {
            return Err(StoreError::MissingField("student_id").into());
        }
        if name.is_empty() {
            return Err(StoreError::MissingField("name").into());
        }
        if self.store.get(student_id).await?.is_some() {
            return Err(StoreError::Duplicate(student_id.to_string()).into());
        }

        // Held for the whole capture so a scan cannot grab the camera meanwhile.
        let session = self.session.lock().await;
        if session.is_some() {
            return Err(ScanError::CameraBusy);
        }

        let extractor = self.models.ensure_loaded().await?;
        let source = self.open_camera(selected_device(device)).await?;
        let worker = spawn_capture_worker(source, extractor)?;
        let captured = worker.handle().enroll(self.settings.frames_per_enroll).await;
        worker.shutdown().await;
        drop(session);

        let descriptor = captured?;
        tracing::debug!(
            student_id = %student_id,
            confidence = descriptor.detection_confidence,
            "enrollment descriptor captured"
        );
        Ok(self.store.enroll(student_id, name, descriptor.embedding).await?)
    }
}

/// Blank device names fall back to the default camera.
fn selected_device(device: Option<&str>) -> Option<String> {
    device
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

/// State owned by the periodic scan task.
struct ScanTick<A: AttendanceSink> {
    handle: CaptureHandle,
    candidates: Vec<Identity>,
    subject: String,
    threshold: f32,
    gate: CooldownGate,
    sink: Arc<A>,
    active: Arc<AtomicBool>,
    snapshot: Arc<watch::Sender<ScanSnapshot>>,
    events: broadcast::Sender<ScanEvent>,
}

async fn run_scan_loop<A: AttendanceSink>(mut tick: ScanTick<A>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if !tick.is_active() {
            break;
        }
        tick.run_once().await;
    }
}

impl<A: AttendanceSink> ScanTick<A> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_match(&self, current: Option<MatchResult>) {
        self.snapshot.send_if_modified(|s| {
            if s.current_match == current {
                return false;
            }
            s.current_match = current;
            true
        });
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.events.send(event);
    }

    async fn run_once(&mut self) {
        let descriptor = match self.handle.extract().await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(error = %e, "frame extraction failed");
                if self.is_active() {
                    self.emit(ScanEvent::ExtractFailed {
                        reason: e.to_string(),
                    });
                }
                return;
            }
        };
        if !self.is_active() {
            return;
        }
        let Some(descriptor) = descriptor else {
            self.set_match(None);
            return;
        };

        let matched = EuclideanMatcher.compare(&descriptor.embedding, &self.candidates, self.threshold);
        if !self.is_active() {
            return;
        }
        let Some(matched) = matched else {
            self.set_match(None);
            return;
        };

        tracing::debug!(
            student_id = %matched.student_id,
            distance = matched.distance,
            confidence = matched.confidence,
            "face matched"
        );
        self.set_match(Some(matched.clone()));
        self.emit(ScanEvent::Matched {
            result: matched.clone(),
        });

        let outcome = self
            .gate
            .consider_mark(&matched, &self.subject, Utc::now(), self.sink.as_ref())
            .await;
        if !self.is_active() {
            return;
        }

        match outcome {
            MarkOutcome::Marked(record) => {
                let status = format!("Attendance marked for {}", record.name);
                self.snapshot.send_modify(|s| s.status = status);
                self.emit(ScanEvent::Marked { record });
            }
            MarkOutcome::Suppressed(reason) => self.emit(ScanEvent::Suppressed {
                student_id: matched.student_id,
                reason,
            }),
            MarkOutcome::Failed(reason) => self.emit(ScanEvent::WriteFailed {
                student_id: matched.student_id,
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{FakeSource, ScriptedExtractor};
    use crate::gate::tests::{FakeSink, Reply};
    use crate::models::tests::NullExtractor;
    use crate::store::tests::{embedding, store};
    use crate::store::ALL_SCOPE_ID;
    use rollcall_core::detector::DetectorError;
    use rollcall_core::{DescriptorExtractor, Embedding, ExtractError, FaceDescriptor};
    use std::sync::atomic::AtomicUsize;

    struct FakeCameras {
        brightness: u8,
        fail: Option<fn() -> CameraError>,
        opened: AtomicUsize,
        devices: std::sync::Mutex<Vec<Option<String>>>,
        released: std::sync::Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeCameras {
        fn with(fail: Option<fn() -> CameraError>) -> Arc<Self> {
            Arc::new(Self {
                brightness: 200,
                fail,
                opened: AtomicUsize::new(0),
                devices: std::sync::Mutex::new(Vec::new()),
                released: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn new() -> Arc<Self> {
            Self::with(None)
        }

        fn failing(fail: fn() -> CameraError) -> Arc<Self> {
            Self::with(Some(fail))
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        fn devices(&self) -> Vec<Option<String>> {
            self.devices.lock().unwrap().clone()
        }

        fn released(&self, index: usize) -> bool {
            self.released.lock().unwrap()[index].load(Ordering::SeqCst)
        }
    }

    impl CameraProvider for FakeCameras {
        fn open(&self, device: Option<&str>) -> Result<Box<dyn FrameSource>, CameraError> {
            if let Some(fail) = self.fail {
                return Err(fail());
            }
            self.devices.lock().unwrap().push(device.map(str::to_string));
            let source = FakeSource::new(self.brightness);
            self.released.lock().unwrap().push(Arc::clone(&source.released));
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(source))
        }
    }

    fn settings() -> ScanSettings {
        ScanSettings {
            threshold: 0.6,
            interval: Duration::from_secs(2),
            cooldown: chrono::Duration::seconds(300),
            write_timeout: Duration::from_secs(5),
            frames_per_enroll: 3,
        }
    }

    /// Model service whose extractor always sees `seen`.
    fn models_seeing(seen: Option<Embedding>) -> Arc<ModelService> {
        Arc::new(ModelService::new(move || {
            let descriptor = seen.clone().map(|embedding| FaceDescriptor {
                embedding,
                detection_confidence: 0.9,
            });
            Ok(Box::new(ScriptedExtractor::new(vec![descriptor])) as Box<dyn DescriptorExtractor>)
        }))
    }

    async fn scanner(
        models: Arc<ModelService>,
        cameras: Arc<FakeCameras>,
        sink: FakeSink,
    ) -> (Scanner<FakeSink>, Arc<FakeSink>) {
        let sink = Arc::new(sink);
        let scanner = Scanner::new(settings(), store().await, Arc::clone(&sink), models, cameras);
        (scanner, sink)
    }

    async fn next_event<F>(rx: &mut broadcast::Receiver<ScanEvent>, pred: F) -> ScanEvent
    where
        F: Fn(&ScanEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_marks_once_then_suppresses() {
        let cameras = FakeCameras::new();
        let (scanner, sink) = scanner(models_seeing(Some(embedding(0.1))), cameras.clone(), FakeSink::new()).await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();
        scanner.store().create_scope("cs101", "Intro to CS").await.unwrap();
        scanner.store().add_to_scope("cs101", ["S1"]).await.unwrap();

        let mut events = scanner.subscribe();
        let outcome = scanner.start(Some("cs101"), None).await.unwrap();
        assert_eq!(outcome, StartOutcome::Scanning { candidates: 1 });
        assert_eq!(scanner.snapshot().state, ScanState::Scanning);

        let marked = next_event(&mut events, |e| matches!(e, ScanEvent::Marked { .. })).await;
        let ScanEvent::Marked { record } = marked else { unreachable!() };
        assert_eq!(record.student_id, "S1");
        assert_eq!(record.subject, "Intro to CS");
        assert!((record.confidence - 1.0).abs() < 1e-6);

        let suppressed = next_event(&mut events, |e| matches!(e, ScanEvent::Suppressed { .. })).await;
        assert!(matches!(
            suppressed,
            ScanEvent::Suppressed { reason: SuppressReason::Cooldown, .. }
        ));
        assert_eq!(sink.write_count(), 1);

        let current = scanner.snapshot().current_match.unwrap();
        assert_eq!(current.student_id, "S1");
        scanner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_scope_keeps_camera_without_timer() {
        let cameras = FakeCameras::new();
        let (scanner, sink) = scanner(models_seeing(Some(embedding(0.1))), cameras.clone(), FakeSink::new()).await;
        scanner.store().create_scope("empty", "Empty Course").await.unwrap();

        let mut events = scanner.subscribe();
        let outcome = scanner.start(Some("empty"), None).await.unwrap();
        assert_eq!(outcome, StartOutcome::NoEnrolledFaces);

        let snapshot = scanner.snapshot();
        assert_eq!(snapshot.state, ScanState::CameraStarting);
        assert_eq!(snapshot.status, "No enrolled faces in this scope");
        assert_eq!(cameras.opened(), 1);
        assert!(!cameras.released(0));
        assert!(matches!(events.recv().await.unwrap(), ScanEvent::NoEnrolledFaces { .. }));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.write_count(), 0);
        assert!(events.try_recv().is_err());

        scanner.stop().await;
        assert!(cameras.released(0));
        assert_eq!(scanner.snapshot().state, ScanState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_scope_marks_general_subject() {
        let (scanner, _sink) =
            scanner(models_seeing(Some(embedding(0.1))), FakeCameras::new(), FakeSink::new()).await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();

        let mut events = scanner.subscribe();
        scanner.start(Some(ALL_SCOPE_ID), None).await.unwrap();
        let ScanEvent::Marked { record } =
            next_event(&mut events, |e| matches!(e, ScanEvent::Marked { .. })).await
        else {
            unreachable!()
        };
        assert_eq!(record.subject, "General");
        scanner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_face_writes_nothing() {
        let (scanner, sink) =
            scanner(models_seeing(Some(embedding(5.0))), FakeCameras::new(), FakeSink::new()).await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();

        scanner.start(Some(ALL_SCOPE_ID), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(sink.write_count(), 0);
        assert!(scanner.snapshot().current_match.is_none());
        scanner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_next_tick() {
        let (scanner, sink) = scanner(
            models_seeing(Some(embedding(0.1))),
            FakeCameras::new(),
            FakeSink::with_replies(vec![Reply::Fail]),
        )
        .await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();

        let mut events = scanner.subscribe();
        scanner.start(Some(ALL_SCOPE_ID), None).await.unwrap();
        next_event(&mut events, |e| matches!(e, ScanEvent::WriteFailed { .. })).await;
        next_event(&mut events, |e| matches!(e, ScanEvent::Marked { .. })).await;
        assert_eq!(sink.write_count(), 2);
        scanner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_camera_and_halts_writes() {
        let cameras = FakeCameras::new();
        let (scanner, sink) = scanner(models_seeing(Some(embedding(0.1))), cameras.clone(), FakeSink::new()).await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();

        let mut events = scanner.subscribe();
        scanner.start(Some(ALL_SCOPE_ID), None).await.unwrap();
        next_event(&mut events, |e| matches!(e, ScanEvent::Matched { .. })).await;

        scanner.stop().await;
        assert!(cameras.released(0));
        assert_eq!(scanner.snapshot().state, ScanState::Idle);
        let writes = sink.write_count();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.write_count(), writes);

        // Idempotent.
        scanner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_with_new_scope_stops_previous() {
        let cameras = FakeCameras::new();
        let (scanner, _sink) =
            scanner(models_seeing(None), cameras.clone(), FakeSink::new()).await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();
        scanner.store().create_scope("cs101", "Intro to CS").await.unwrap();
        scanner.store().create_scope("ma201", "Linear Algebra").await.unwrap();
        scanner.store().add_to_scope("cs101", ["S1"]).await.unwrap();
        scanner.store().add_to_scope("ma201", ["S1"]).await.unwrap();

        scanner.start(Some("cs101"), None).await.unwrap();
        scanner.start(Some("ma201"), None).await.unwrap();

        assert_eq!(cameras.opened(), 2);
        assert!(cameras.released(0));
        assert!(!cameras.released(1));
        assert_eq!(scanner.snapshot().scope.unwrap().name, "Linear Algebra");
        scanner.stop().await;
        assert!(cameras.released(1));
    }

    #[tokio::test]
    async fn test_start_requires_scope() {
        let cameras = FakeCameras::new();
        let (scanner, _) = scanner(models_seeing(None), cameras.clone(), FakeSink::new()).await;
        assert!(matches!(scanner.start(None, None).await, Err(ScanError::NoScopeSelected)));
        assert!(matches!(scanner.start(Some("  "), None).await, Err(ScanError::NoScopeSelected)));
        assert!(matches!(
            scanner.start(Some("nope"), None).await,
            Err(ScanError::UnknownScope(id)) if id == "nope"
        ));
        assert_eq!(scanner.snapshot().state, ScanState::Idle);
        assert_eq!(cameras.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_scope_keeps_running_session() {
        let cameras = FakeCameras::new();
        let (scanner, _) = scanner(models_seeing(None), cameras.clone(), FakeSink::new()).await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();
        scanner.start(Some(ALL_SCOPE_ID), None).await.unwrap();

        assert!(matches!(scanner.start(None, None).await, Err(ScanError::NoScopeSelected)));
        let snapshot = scanner.snapshot();
        assert_eq!(snapshot.state, ScanState::Scanning);
        assert_eq!(snapshot.status, "Scanning...");
        assert_eq!(snapshot.scope.unwrap().id, ALL_SCOPE_ID);
        assert_eq!(cameras.opened(), 1);
        assert!(!cameras.released(0));

        scanner.stop().await;
        assert!(matches!(scanner.start(None, None).await, Err(ScanError::NoScopeSelected)));
        assert_eq!(scanner.snapshot().status, "Select a scope to start scanning");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_selection_reaches_provider() {
        let cameras = FakeCameras::new();
        let (scanner, _) =
            scanner(models_seeing(Some(embedding(0.2))), cameras.clone(), FakeSink::new()).await;

        scanner.enroll("S1", "Alice", Some("/dev/video2")).await.unwrap();
        scanner.start(Some(ALL_SCOPE_ID), Some(" ")).await.unwrap();
        scanner.start(Some(ALL_SCOPE_ID), Some("/dev/video4")).await.unwrap();

        assert_eq!(
            cameras.devices(),
            vec![Some("/dev/video2".to_string()), None, Some("/dev/video4".to_string())]
        );
        scanner.stop().await;
    }

    /// Signals when a frame reaches it, then blocks until released.
    struct GatedExtractor {
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        release: std::sync::mpsc::Receiver<()>,
        seen: FaceDescriptor,
    }

    impl DescriptorExtractor for GatedExtractor {
        fn extract(&mut self, _: &[u8], _: u32, _: u32) -> Result<Option<FaceDescriptor>, ExtractError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(Some(self.seen.clone()))
        }
    }

    // Real time: the stop task must reach the worker join while extraction is blocked.
    #[tokio::test]
    async fn test_stop_during_extraction_discards_result() {
        let (entered_tx, mut entered) = tokio::sync::mpsc::unbounded_channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let gated = std::sync::Mutex::new(Some(GatedExtractor {
            entered: entered_tx,
            release: release_rx,
            seen: FaceDescriptor {
                embedding: embedding(0.1),
                detection_confidence: 0.9,
            },
        }));
        let models = Arc::new(ModelService::new(move || {
            let extractor = gated.lock().unwrap().take().expect("loaded once");
            Ok(Box::new(extractor) as Box<dyn DescriptorExtractor>)
        }));

        let cameras = FakeCameras::new();
        let sink = Arc::new(FakeSink::new());
        let fast = ScanSettings {
            interval: Duration::from_millis(20),
            ..settings()
        };
        let scanner = Arc::new(Scanner::new(
            fast,
            store().await,
            Arc::clone(&sink),
            models,
            cameras.clone(),
        ));
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();

        let mut events = scanner.subscribe();
        scanner.start(Some(ALL_SCOPE_ID), None).await.unwrap();
        entered.recv().await.unwrap();

        let stopping = tokio::spawn({
            let scanner = Arc::clone(&scanner);
            async move { scanner.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert!(!cameras.released(0));

        release.send(()).unwrap();
        stopping.await.unwrap();
        assert!(cameras.released(0));
        assert_eq!(scanner.snapshot().state, ScanState::Idle);
        assert!(scanner.snapshot().current_match.is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.write_count(), 0);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.last(), Some(ScanEvent::Stopped)));
        assert!(!seen
            .iter()
            .any(|e| matches!(e, ScanEvent::Matched { .. } | ScanEvent::Marked { .. })));
    }

    #[tokio::test]
    async fn test_camera_errors_stay_distinct() {
        let cases: [(fn() -> CameraError, fn(&CameraError) -> bool); 3] = [
            (
                || CameraError::PermissionDenied("/dev/video0".into()),
                |e| matches!(e, CameraError::PermissionDenied(_)),
            ),
            (
                || CameraError::NoDevice("/dev/video0".into()),
                |e| matches!(e, CameraError::NoDevice(_)),
            ),
            (
                || CameraError::Unsupported("/dev/video0".into()),
                |e| matches!(e, CameraError::Unsupported(_)),
            ),
        ];
        for (fail, expected) in cases {
            let (scanner, _) = scanner(models_seeing(None), FakeCameras::failing(fail), FakeSink::new()).await;
            let err = scanner.start(Some(ALL_SCOPE_ID), None).await.err().unwrap();
            let ScanError::Camera(camera) = err else {
                panic!("expected a camera error");
            };
            assert!(expected(&camera));

            let snapshot = scanner.snapshot();
            assert_eq!(snapshot.state, ScanState::Idle);
            assert_eq!(snapshot.status, camera.user_message());
        }
    }

    #[tokio::test]
    async fn test_model_load_failure_leaves_idle() {
        let models = Arc::new(ModelService::new(|| {
            Err(ExtractError::Detector(DetectorError::ModelNotFound(
                "face_detector.onnx".into(),
            )))
        }));
        let cameras = FakeCameras::new();
        let (scanner, _) = scanner(models, cameras.clone(), FakeSink::new()).await;

        assert!(matches!(
            scanner.start(Some(ALL_SCOPE_ID), None).await,
            Err(ScanError::ModelLoad(_))
        ));
        assert_eq!(scanner.snapshot().state, ScanState::Idle);
        assert_eq!(cameras.opened(), 0);
    }

    #[tokio::test]
    async fn test_enroll_captures_and_stores() {
        let cameras = FakeCameras::new();
        let (scanner, _) = scanner(models_seeing(Some(embedding(0.3))), cameras.clone(), FakeSink::new()).await;

        let identity = scanner.enroll(" S9 ", "Dana", None).await.unwrap();
        assert_eq!(identity.student_id, "S9");
        assert!(cameras.released(0));

        let stored = scanner.store().get("S9").await.unwrap().unwrap();
        assert_eq!(stored.embedding, embedding(0.3));

        assert!(matches!(
            scanner.enroll("S9", "Dana", None).await,
            Err(ScanError::Store(StoreError::Duplicate(_)))
        ));
        assert_eq!(cameras.opened(), 1);
    }

    #[tokio::test]
    async fn test_enroll_without_face() {
        let cameras = FakeCameras::new();
        let models = Arc::new(ModelService::new(|| {
            Ok(Box::new(NullExtractor) as Box<dyn DescriptorExtractor>)
        }));
        let (scanner, _) = scanner(models, cameras.clone(), FakeSink::new()).await;

        assert!(matches!(scanner.enroll("S1", "Alice", None).await, Err(ScanError::NoFaceDetected)));
        assert!(cameras.released(0));
        assert!(scanner.store().get("S1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enroll_refused_while_scanning() {
        let cameras = FakeCameras::new();
        let (scanner, _) = scanner(models_seeing(None), cameras.clone(), FakeSink::new()).await;
        scanner.store().enroll("S1", "Alice", embedding(0.1)).await.unwrap();
        scanner.start(Some(ALL_SCOPE_ID), None).await.unwrap();

        assert!(matches!(scanner.enroll("S2", "Bob", None).await, Err(ScanError::CameraBusy)));
        assert_eq!(cameras.opened(), 1);
        scanner.stop().await;
    }
}
