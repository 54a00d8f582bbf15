//! SQLite-backed embedding store and roster tables.

use chrono::{DateTime, TimeZone, Utc};
use rollcall_core::{Embedding, Identity, EMBEDDING_DIM};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

/// Scope id that selects every enrolled identity.
pub const ALL_SCOPE_ID: &str = "*";
/// Subject recorded for attendance taken against [`Scope::All`].
pub const GENERAL_SUBJECT: &str = "General";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    student_id  TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    embedding   BLOB,
    enrolled_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS scopes (
    id   TEXT PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scope_members (
    scope_id   TEXT NOT NULL REFERENCES scopes(id) ON DELETE CASCADE,
    student_id TEXT NOT NULL,
    PRIMARY KEY (scope_id, student_id)
);
CREATE TABLE IF NOT EXISTS attendance (
    id         TEXT PRIMARY KEY,
    student_id TEXT NOT NULL,
    name       TEXT NOT NULL,
    subject    TEXT NOT NULL,
    confidence REAL NOT NULL,
    marked_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS attendance_student_time ON attendance (student_id, marked_at);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("student id already enrolled: {0}")]
    Duplicate(String),
    #[error("invalid embedding: expected {EMBEDDING_DIM} finite values, got {0} values")]
    InvalidEmbedding(usize),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown scope: {0}")]
    UnknownScope(String),
    #[error("scope id is reserved: {0}")]
    ReservedScope(String),
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

/// Which identities are eligible as match candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Roster(String),
}

impl Scope {
    pub fn from_id(id: &str) -> Self {
        if id == ALL_SCOPE_ID {
            Scope::All
        } else {
            Scope::Roster(id.to_string())
        }
    }
}

/// A roster (subject / course).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeInfo {
    pub id: String,
    pub name: String,
    pub members: usize,
}

/// Identity listing entry without the embedding.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub student_id: String,
    pub name: String,
    pub enrolled_at: DateTime<Utc>,
}

/// Open (or create) the database file and apply the schema.
pub async fn open_database(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "could not create database directory");
        }
    }
    let conn = Connection::open(path).await?;
    migrate(&conn).await?;
    tracing::info!(path = %path.display(), "database opened");
    Ok(conn)
}

/// In-memory database with the schema applied.
pub async fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory().await?;
    migrate(&conn).await?;
    Ok(conn)
}

async fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.call(|conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Raw identity row as read from SQLite, decoded outside the connection thread.
type IdentityRow = (String, String, Option<Vec<u8>>, i64);

fn decode_identity((student_id, name, blob, enrolled_ms): IdentityRow) -> Option<Identity> {
    let embedding = blob.as_deref().and_then(Embedding::from_le_bytes);
    match embedding {
        Some(embedding) if embedding.is_well_formed() => Some(Identity {
            student_id,
            name,
            embedding,
            enrolled_at: millis_to_utc(enrolled_ms),
        }),
        Some(embedding) => {
            tracing::warn!(
                student_id = %student_id,
                len = embedding.values.len(),
                "excluding identity with malformed embedding"
            );
            None
        }
        None => {
            tracing::warn!(student_id = %student_id, "excluding identity without a decodable embedding");
            None
        }
    }
}

/// Enrolled identities and rosters.
#[derive(Clone)]
pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Enroll a new identity. Ids and names are trimmed.
    pub async fn enroll(
        &self,
        student_id: &str,
        name: &str,
        embedding: Embedding,
    ) -> Result<Identity, StoreError> {
        let student_id = student_id.trim().to_string();
        let name = name.trim().to_string();
        if student_id.is_empty() {
            return Err(StoreError::MissingField("student_id"));
        }
        if name.is_empty() {
            return Err(StoreError::MissingField("name"));
        }
        if !embedding.is_well_formed() {
            return Err(StoreError::InvalidEmbedding(embedding.values.len()));
        }

        let enrolled_at = Utc::now();
        let blob = embedding.to_le_bytes();
        let (id, nm) = (student_id.clone(), name.clone());
        let inserted = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM identities WHERE student_id = ?1)",
                    [&id],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(false);
                }
                match conn.execute(
                    "INSERT INTO identities (student_id, name, embedding, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, nm, blob, enrolled_at.timestamp_millis()],
                ) {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !inserted {
            return Err(StoreError::Duplicate(student_id));
        }

        tracing::info!(student_id = %student_id, "identity enrolled");
        Ok(Identity {
            student_id,
            name,
            embedding,
            enrolled_at: millis_to_utc(enrolled_at.timestamp_millis()),
        })
    }

    /// Look up one identity. A stored but malformed embedding reads as absent.
    pub async fn get(&self, student_id: &str) -> Result<Option<Identity>, StoreError> {
        let id = student_id.trim().to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT student_id, name, embedding, enrolled_at FROM identities WHERE student_id = ?1",
                        [&id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row.and_then(decode_identity))
    }

    /// All identities, newest enrollment first.
    pub async fn list(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, name, enrolled_at FROM identities ORDER BY enrolled_at DESC, student_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(IdentitySummary {
                            student_id: row.get(0)?,
                            name: row.get(1)?,
                            enrolled_at: millis_to_utc(row.get(2)?),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Identities eligible for matching within `scope`.
    ///
    /// Rows whose embedding is missing or not exactly [`EMBEDDING_DIM`] long
    /// are skipped; they never fail the fetch.
    pub async fn fetch_candidates(&self, scope: &Scope) -> Result<Vec<Identity>, StoreError> {
        let scope = scope.clone();
        let rows: Vec<IdentityRow> = self
            .conn
            .call(move |conn| {
                let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<IdentityRow> {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                };
                let rows = match &scope {
                    Scope::All => {
                        let mut stmt = conn.prepare(
                            "SELECT student_id, name, embedding, enrolled_at
                             FROM identities ORDER BY student_id",
                        )?;
                        let rows = stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    Scope::Roster(scope_id) => {
                        let mut stmt = conn.prepare(
                            "SELECT i.student_id, i.name, i.embedding, i.enrolled_at
                             FROM identities i
                             JOIN scope_members m ON m.student_id = i.student_id
                             WHERE m.scope_id = ?1
                             ORDER BY i.student_id",
                        )?;
                        let rows = stmt.query_map([scope_id], map)?.collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await?;

        let total = rows.len();
        let candidates: Vec<Identity> = rows.into_iter().filter_map(decode_identity).collect();
        tracing::debug!(total, usable = candidates.len(), "fetched match candidates");
        Ok(candidates)
    }

    /// Delete an identity and its embedding. Returns whether anything was removed.
    pub async fn remove(&self, student_id: &str) -> Result<bool, StoreError> {
        let id = student_id.trim().to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM identities WHERE student_id = ?1", [&id])?))
            .await?;
        if removed > 0 {
            tracing::info!(student_id = %student_id.trim(), "identity removed");
        }
        Ok(removed > 0)
    }

    /// Create a roster, or rename it if it already exists.
    pub async fn create_scope(&self, id: &str, name: &str) -> Result<ScopeInfo, StoreError> {
        let id = id.trim().to_string();
        let name = name.trim().to_string();
        if id.is_empty() {
            return Err(StoreError::MissingField("scope id"));
        }
        if id == ALL_SCOPE_ID {
            return Err(StoreError::ReservedScope(id));
        }
        if name.is_empty() {
            return Err(StoreError::MissingField("scope name"));
        }
        let (sid, snm) = (id.clone(), name.clone());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO scopes (id, name) VALUES (?1, ?2)
                     ON CONFLICT (id) DO UPDATE SET name = excluded.name",
                    params![sid, snm],
                )?;
                Ok(())
            })
            .await?;
        self.get_scope(&id)
            .await?
            .ok_or(StoreError::UnknownScope(id))
    }

    /// Put students on a roster in one transaction. Returns how many were not
    /// already on it. Nothing is written if the roster does not exist.
    pub async fn add_to_scope<I, S>(&self, scope_id: &str, student_ids: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let scope_id = scope_id.trim().to_string();
        let ids: Vec<String> = student_ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .collect();
        if ids.is_empty() || ids.iter().any(String::is_empty) {
            return Err(StoreError::MissingField("student_id"));
        }
        let sid = scope_id.clone();
        let added = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM scopes WHERE id = ?1)",
                    [&sid],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(None);
                }
                let mut added = 0;
                {
                    let mut insert = tx.prepare(
                        "INSERT INTO scope_members (scope_id, student_id) VALUES (?1, ?2)
                         ON CONFLICT (scope_id, student_id) DO NOTHING",
                    )?;
                    for id in &ids {
                        added += insert.execute(params![sid, id])?;
                    }
                }
                tx.commit()?;
                Ok(Some(added))
            })
            .await?;
        let added = added.ok_or_else(|| StoreError::UnknownScope(scope_id.clone()))?;
        tracing::info!(scope = %scope_id, added, "roster updated");
        Ok(added)
    }

    /// Look up a roster. [`ALL_SCOPE_ID`] resolves to a synthetic "General" scope.
    pub async fn get_scope(&self, id: &str) -> Result<Option<ScopeInfo>, StoreError> {
        let id = id.trim().to_string();
        if id == ALL_SCOPE_ID {
            let members = self
                .conn
                .call(|conn| {
                    let n: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                    Ok(n)
                })
                .await?;
            return Ok(Some(ScopeInfo {
                id,
                name: GENERAL_SUBJECT.to_string(),
                members: members as usize,
            }));
        }
        let scope = self
            .conn
            .call(move |conn| {
                let scope = conn
                    .query_row(
                        "SELECT s.id, s.name, (SELECT COUNT(*) FROM scope_members m WHERE m.scope_id = s.id)
                         FROM scopes s WHERE s.id = ?1",
                        [&id],
                        |row| {
                            Ok(ScopeInfo {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                members: row.get::<_, i64>(2)? as usize,
                            })
                        },
                    )
                    .optional()?;
                Ok(scope)
            })
            .await?;
        Ok(scope)
    }

    /// All rosters, ordered by id.
    pub async fn list_scopes(&self) -> Result<Vec<ScopeInfo>, StoreError> {
        let scopes = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.name, (SELECT COUNT(*) FROM scope_members m WHERE m.scope_id = s.id)
                     FROM scopes s ORDER BY s.id",
                )?;
                let scopes = stmt
                    .query_map([], |row| {
                        Ok(ScopeInfo {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            members: row.get::<_, i64>(2)? as usize,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(scopes)
            })
            .await?;
        Ok(scopes)
    }
}
