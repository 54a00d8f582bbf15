use crate::attendance::{AttendanceFilter, AttendanceLog, MarkError};
use crate::scanner::{ScanError, Scanner};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use zbus::{fdo, interface};

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Scanner1
/// Object path: /org/rollcall/Scanner1
pub struct RollcallService {
    pub scanner: Arc<Scanner<AttendanceLog>>,
    pub log: AttendanceLog,
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

/// Camera failures carry the operator-facing message first.
fn scan_failed(e: ScanError) -> fdo::Error {
    match e {
        ScanError::Camera(camera) => fdo::Error::Failed(format!("{}: {camera}", camera.user_message())),
        other => failed(other),
    }
}

fn mark_failed(e: MarkError) -> fdo::Error {
    match e {
        MarkError::Invalid(_) => fdo::Error::InvalidArgs(e.to_string()),
        other => failed(other),
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Empty strings stand for "not given" since D-Bus has no optional arguments.
fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[interface(name = "org.rollcall.Scanner1")]
impl RollcallService {
    /// Capture a face and enroll it for `student_id`. An empty `device` uses
    /// the configured camera.
    async fn enroll(&self, student_id: &str, name: &str, device: &str) -> fdo::Result<String> {
        tracing::info!(student_id, device, "enroll requested");
        let device = non_empty(device);
        let identity = self
            .scanner
            .enroll(student_id, name, device.as_deref())
            .await
            .map_err(|e| {
                tracing::warn!(student_id, error = %e, "enroll failed");
                scan_failed(e)
            })?;
        to_json(&serde_json::json!({
            "student_id": identity.student_id,
            "name": identity.name,
            "enrolled_at": identity.enrolled_at,
        }))
    }

    /// Delete an enrolled identity. Returns false when it did not exist.
    async fn remove(&self, student_id: &str) -> fdo::Result<bool> {
        tracing::info!(student_id, "remove requested");
        self.scanner.store().remove(student_id).await.map_err(failed)
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self.scanner.store().list().await.map_err(failed)?;
        to_json(&identities)
    }

    /// Create or rename a roster.
    async fn create_scope(&self, id: &str, name: &str) -> fdo::Result<String> {
        tracing::info!(scope = id, name, "create_scope requested");
        let scope = self.scanner.store().create_scope(id, name).await.map_err(failed)?;
        to_json(&scope)
    }

    /// Put students on a roster. Returns how many were not already on it.
    async fn add_to_scope(&self, scope_id: &str, student_ids: Vec<String>) -> fdo::Result<u32> {
        tracing::info!(scope = scope_id, count = student_ids.len(), "add_to_scope requested");
        let added = self
            .scanner
            .store()
            .add_to_scope(scope_id, &student_ids)
            .await
            .map_err(failed)?;
        Ok(u32::try_from(added).unwrap_or(u32::MAX))
    }

    async fn list_scopes(&self) -> fdo::Result<String> {
        let scopes = self.scanner.store().list_scopes().await.map_err(failed)?;
        to_json(&scopes)
    }

    /// Start scanning a roster id, or `*` for every enrolled identity. An
    /// empty `device` uses the configured camera.
    async fn start_scan(&self, scope_id: &str, device: &str) -> fdo::Result<String> {
        tracing::info!(scope = scope_id, device, "start_scan requested");
        let outcome = self
            .scanner
            .start(non_empty(scope_id).as_deref(), non_empty(device).as_deref())
            .await
            .map_err(scan_failed)?;
        to_json(&outcome)
    }

    async fn stop_scan(&self) -> fdo::Result<()> {
        tracing::info!("stop_scan requested");
        self.scanner.stop().await;
        Ok(())
    }

    /// Return daemon and scan status.
    async fn status(&self) -> fdo::Result<String> {
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": self.scanner.models_loaded(),
            "scan": self.scanner.snapshot(),
        }))
    }

    /// Mark a student present by hand with full confidence. An empty
    /// `subject` records as "General".
    async fn mark_attendance(
        &self,
        student_id: &str,
        name: &str,
        subject: &str,
    ) -> fdo::Result<String> {
        let record = self
            .log
            .mark_manual(student_id, name, subject)
            .await
            .map_err(mark_failed)?;
        to_json(&record)
    }

    /// List attendance. Empty arguments are not filtered on; `date` is `YYYY-MM-DD` (UTC).
    async fn list_attendance(
        &self,
        date: &str,
        subject: &str,
        student_id: &str,
    ) -> fdo::Result<String> {
        let date = match non_empty(date) {
            Some(d) => Some(
                NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                    .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date {d:?}: {e}")))?,
            ),
            None => None,
        };
        let filter = AttendanceFilter {
            date,
            subject: non_empty(subject),
            student_id: non_empty(student_id),
        };
        let records = self.log.list(filter).await.map_err(failed)?;
        to_json(&records)
    }

    async fn list_devices(&self) -> fdo::Result<String> {
        let devices = tokio::task::spawn_blocking(rollcall_hw::Camera::list_devices)
            .await
            .map_err(failed)?;
        to_json(&devices)
    }
}
