use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod engine;
mod gate;
mod models;
mod scanner;
mod store;

use attendance::AttendanceLog;
use config::Config;
use engine::V4lCameraProvider;
use models::ModelService;
use scanner::{ScanEvent, ScanSettings, Scanner};
use store::FaceStore;

const BUS_NAME: &str = "org.rollcall.Scanner1";
const OBJECT_PATH: &str = "/org/rollcall/Scanner1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let conn = store::open_database(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let store = FaceStore::new(conn.clone());
    let log = AttendanceLog::new(conn, config.recent_window());

    // Models load lazily on first scan or enroll.
    let models = Arc::new(ModelService::onnx(config.model_dir.clone()));
    let cameras = Arc::new(V4lCameraProvider {
        device: config.camera_device.clone(),
    });

    let settings = ScanSettings {
        threshold: config.match_threshold,
        interval: config.scan_interval(),
        cooldown: config.cooldown(),
        write_timeout: config.write_timeout(),
        frames_per_enroll: config.frames_per_enroll,
    };
    let scanner = Arc::new(Scanner::new(
        settings,
        store,
        Arc::new(log.clone()),
        models,
        cameras,
    ));

    tokio::spawn(log_events(scanner.subscribe()));

    let service = dbus_interface::RollcallService {
        scanner: Arc::clone(&scanner),
        log,
    };
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = BUS_NAME, system = config.system_bus, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    scanner.stop().await;

    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<ScanEvent>) {
    loop {
        match events.recv().await {
            Ok(ScanEvent::Marked { record }) => tracing::info!(
                student_id = %record.student_id,
                name = %record.name,
                subject = %record.subject,
                confidence = record.confidence,
                "attendance marked"
            ),
            Ok(ScanEvent::Suppressed { student_id, reason }) => {
                tracing::debug!(student_id = %student_id, ?reason, "attendance suppressed")
            }
            Ok(ScanEvent::WriteFailed { student_id, reason }) => {
                tracing::warn!(student_id = %student_id, reason = %reason, "attendance write failed")
            }
            Ok(ScanEvent::NoEnrolledFaces { scope }) => {
                tracing::warn!(scope = %scope.id, "no enrolled faces in scope")
            }
            Ok(other) => tracing::debug!(event = ?other, "scan event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "scan event log lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
