//! Attendance records: the write collaborator used by the scan loop.

use crate::store::{millis_to_utc, GENERAL_SUBJECT};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::params;
use rusqlite::types::Value;
use serde::Serialize;
use std::future::Future;
use thiserror::Error;
use tokio_rusqlite::Connection;

const LIST_LIMIT: i64 = 1000;
/// Confidence recorded for marks entered by an operator rather than a match.
pub const MANUAL_CONFIDENCE: f32 = 1.0;

/// Payload of a "mark attendance" request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkRequest {
    pub student_id: String,
    pub name: String,
    pub subject: String,
    pub confidence: f32,
}

/// A stored attendance mark.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub name: String,
    pub subject: String,
    pub confidence: f32,
    pub marked_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone)]
pub enum MarkError {
    #[error("attendance already marked recently for {0}")]
    Duplicate(String),
    #[error("invalid attendance request: missing {0}")]
    Invalid(&'static str),
    #[error("attendance write failed: {0}")]
    Transient(String),
}

impl From<tokio_rusqlite::Error> for MarkError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        MarkError::Transient(e.to_string())
    }
}

/// Destination for attendance marks.
///
/// Implementations must reject a mark with [`MarkError::Duplicate`] when the
/// student was already marked recently.
pub trait AttendanceSink: Send + Sync + 'static {
    fn mark(
        &self,
        request: MarkRequest,
    ) -> impl Future<Output = Result<AttendanceRecord, MarkError>> + Send;
}

/// Filters for [`AttendanceLog::list`]; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    /// UTC calendar day.
    pub date: Option<NaiveDate>,
    pub subject: Option<String>,
    pub student_id: Option<String>,
}

/// SQLite attendance log with its own recency check.
#[derive(Clone)]
pub struct AttendanceLog {
    conn: Connection,
    recent_window: Duration,
}

impl AttendanceLog {
    pub fn new(conn: Connection, recent_window: Duration) -> Self {
        Self { conn, recent_window }
    }

    /// Mark a student present by hand. Subject to the same recency check as
    /// scanner marks; a blank subject records as "General".
    pub async fn mark_manual(
        &self,
        student_id: &str,
        name: &str,
        subject: &str,
    ) -> Result<AttendanceRecord, MarkError> {
        tracing::info!(student_id, subject, "manual attendance mark");
        self.mark(MarkRequest {
            student_id: student_id.to_string(),
            name: name.to_string(),
            subject: subject.to_string(),
            confidence: MANUAL_CONFIDENCE,
        })
        .await
    }

    /// Records matching `filter`, newest first, capped at 1000.
    pub async fn list(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>, MarkError> {
        let mut sql = String::from(
            "SELECT id, student_id, name, subject, confidence, marked_at FROM attendance WHERE 1=1",
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(date) = filter.date {
            let (start, end) = day_bounds_millis(date);
            sql.push_str(&format!(" AND marked_at >= ?{} AND marked_at < ?{}", args.len() + 1, args.len() + 2));
            args.push(Value::Integer(start));
            args.push(Value::Integer(end));
        }
        if let Some(subject) = filter.subject {
            sql.push_str(&format!(" AND subject = ?{}", args.len() + 1));
            args.push(Value::Text(subject));
        }
        if let Some(student_id) = filter.student_id {
            sql.push_str(&format!(" AND student_id = ?{}", args.len() + 1));
            args.push(Value::Text(student_id));
        }
        sql.push_str(&format!(" ORDER BY marked_at DESC LIMIT {LIST_LIMIT}"));

        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(rusqlite::params_from_iter(args), |row| {
                        Ok(AttendanceRecord {
                            id: row.get(0)?,
                            student_id: row.get(1)?,
                            name: row.get(2)?,
                            subject: row.get(3)?,
                            confidence: row.get::<_, f64>(4)? as f32,
                            marked_at: millis_to_utc(row.get(5)?),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }
}

fn day_bounds_millis(date: NaiveDate) -> (i64, i64) {
    let start = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    let end = start + Duration::days(1);
    (start.timestamp_millis(), end.timestamp_millis())
}

impl AttendanceSink for AttendanceLog {
    async fn mark(&self, request: MarkRequest) -> Result<AttendanceRecord, MarkError> {
        let student_id = request.student_id.trim().to_string();
        let name = request.name.trim().to_string();
        if student_id.is_empty() {
            return Err(MarkError::Invalid("student_id"));
        }
        if name.is_empty() {
            return Err(MarkError::Invalid("name"));
        }
        let subject = match request.subject.trim() {
            "" => GENERAL_SUBJECT.to_string(),
            s => s.to_string(),
        };

        let now = Utc::now();
        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            student_id,
            name,
            subject,
            confidence: request.confidence,
            marked_at: millis_to_utc(now.timestamp_millis()),
        };
        let since = (now - self.recent_window).timestamp_millis();

        let row = record.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let recent: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM attendance WHERE student_id = ?1 AND marked_at > ?2)",
                    params![row.student_id, since],
                    |r| r.get(0),
                )?;
                if recent {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO attendance (id, student_id, name, subject, confidence, marked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id,
                        row.student_id,
                        row.name,
                        row.subject,
                        row.confidence as f64,
                        row.marked_at.timestamp_millis()
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !inserted {
            tracing::debug!(student_id = %record.student_id, "attendance rejected: marked recently");
            return Err(MarkError::Duplicate(record.student_id));
        }

        tracing::info!(
            student_id = %record.student_id,
            subject = %record.subject,
            confidence = record.confidence,
            "attendance recorded"
        );
        Ok(record)
    }
}
