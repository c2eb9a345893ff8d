//! Durable copy of export job records.
//!
//! The mirror is a crash-recovery fallback for the in-memory store, not a
//! source of truth: writes are best-effort and reads only happen on a cache miss.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::models::{ExportJob, JobStatus};

pub trait JobMirror: Send + Sync {
    fn upsert(&self, job: &ExportJob) -> Result<()>;
    fn fetch(&self, id: &str) -> Result<Option<ExportJob>>;
}

#[derive(Clone)]
pub struct SqliteMirror {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMirror {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open job database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS export_jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output_path TEXT,
                download_url TEXT,
                error TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .context("Failed to create export_jobs table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job database connection poisoned"))
    }
}

impl JobMirror for SqliteMirror {
    fn upsert(&self, job: &ExportJob) -> Result<()> {
        let input = serde_json::to_string(&job.input).context("Failed to encode job input")?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO export_jobs
                (id, status, input, output_path, download_url, error, progress, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                input = excluded.input,
                output_path = excluded.output_path,
                download_url = excluded.download_url,
                error = excluded.error,
                progress = excluded.progress,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
            params![
                job.id,
                job.status.as_str(),
                input,
                job.output_path,
                job.download_url,
                job.error,
                i64::from(job.progress),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to upsert export job {}", job.id))?;
        Ok(())
    }

    fn fetch(&self, id: &str) -> Result<Option<ExportJob>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, status, input, output_path, download_url, error, progress, created_at, updated_at
                 FROM export_jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(StoredRow {
                        id: row.get(0)?,
                        status: row.get(1)?,
                        input: row.get(2)?,
                        output_path: row.get(3)?,
                        download_url: row.get(4)?,
                        error: row.get(5)?,
                        progress: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("Failed to load export job {id}"))?;

        row.map(StoredRow::into_job).transpose()
    }
}

struct StoredRow {
    id: String,
    status: String,
    input: String,
    output_path: Option<String>,
    download_url: Option<String>,
    error: Option<String>,
    progress: i64,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn into_job(self) -> Result<ExportJob> {
        let status = JobStatus::parse(&self.status)
            .with_context(|| format!("Unknown status `{}` for job {}", self.status, self.id))?;
        let input = match serde_json::from_str::<Value>(&self.input) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(ExportJob {
            status,
            input,
            output_path: self.output_path,
            download_url: self.download_url,
            error: self.error,
            progress: self.progress.clamp(0, 100) as u8,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp `{raw}`"))
}

/// Accepts `sqlite://path`, `sqlite:path` or a bare filesystem path.
pub fn database_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}
