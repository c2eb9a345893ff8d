//! Process-wide export job records.
//!
//! Memory is authoritative for the process lifetime. The optional mirror is
//! written through after every mutation and consulted only on a cache miss,
//! so the two are eventually consistent and never transactional.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::{
    error::StoreError,
    mirror::JobMirror,
    models::{ExportJob, JobPatch, JobStatus},
};

#[derive(Clone)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<String, ExportJob>>>,
    mirror: Option<Arc<dyn JobMirror>>,
}

impl JobStore {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            mirror: None,
        }
    }

    pub fn with_mirror(mirror: Arc<dyn JobMirror>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            mirror: Some(mirror),
        }
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }

    pub async fn put(&self, job: ExportJob) {
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job.id.clone(), job.clone());
        }
        self.mirror_upsert(job).await;
    }

    /// Inserts `job` unless a record with the same id is already in memory.
    pub async fn put_if_absent(&self, job: ExportJob) -> bool {
        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job.id) {
                return false;
            }
            jobs.insert(job.id.clone(), job.clone());
        }
        self.mirror_upsert(job).await;
        true
    }

    /// Moves a `queued` job to `running`. Only one caller can win the claim;
    /// everyone else gets `Claimed` or `Terminal`.
    pub async fn claim(&self, id: &str, progress: u8) -> Result<ExportJob, StoreError> {
        let claimed = {
            let mut jobs = self.jobs.write().await;
            let Some(current) = jobs.get_mut(id) else {
                return Err(StoreError::NotFound(id.to_string()));
            };
            match current.status {
                JobStatus::Queued => {}
                JobStatus::Running => return Err(StoreError::Claimed(id.to_string())),
                JobStatus::Completed | JobStatus::Failed => {
                    return Err(StoreError::Terminal(id.to_string()))
                }
            }
            let next = apply_patch(current, JobPatch::running(progress))?;
            *current = next.clone();
            next
        };

        self.mirror_upsert(claimed.clone()).await;
        Ok(claimed)
    }

    /// Merges `patch` into the stored record and returns the new snapshot.
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<ExportJob, StoreError> {
        let updated = {
            let mut jobs = self.jobs.write().await;
            let Some(current) = jobs.get_mut(id) else {
                return Err(StoreError::NotFound(id.to_string()));
            };
            let next = apply_patch(current, patch)?;
            *current = next.clone();
            next
        };

        self.mirror_upsert(updated.clone()).await;
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<ExportJob> {
        {
            let jobs = self.jobs.read().await;
            if let Some(job) = jobs.get(id) {
                return Some(job.clone());
            }
        }

        let mirror = self.mirror.clone()?;
        let lookup_id = id.to_string();
        let fetched = match tokio::task::spawn_blocking(move || mirror.fetch(&lookup_id)).await {
            Ok(Ok(found)) => found?,
            Ok(Err(err)) => {
                warn!(job_id = %id, "Job mirror lookup failed: {err:#}");
                return None;
            }
            Err(err) => {
                warn!(job_id = %id, "Job mirror lookup task join error: {err:#}");
                return None;
            }
        };

        let mut jobs = self.jobs.write().await;
        // A concurrent writer may have populated memory while the mirror was queried.
        let job = jobs.entry(fetched.id.clone()).or_insert(fetched);
        Some(job.clone())
    }

    async fn mirror_upsert(&self, job: ExportJob) {
        let Some(mirror) = self.mirror.clone() else {
            return;
        };
        let job_id = job.id.clone();
        match tokio::task::spawn_blocking(move || mirror.upsert(&job)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(job_id = %job_id, "Job mirror write failed: {err:#}"),
            Err(err) => warn!(job_id = %job_id, "Job mirror write task join error: {err:#}"),
        }
    }
}

fn apply_patch(current: &ExportJob, patch: JobPatch) -> Result<ExportJob, StoreError> {
    if current.status.is_terminal() {
        return Err(StoreError::Terminal(current.id.clone()));
    }

    let status = patch.status.unwrap_or(current.status);
    if !current.status.can_advance_to(status) {
        return Err(StoreError::transition(&current.id, current.status, status));
    }

    let mut next = current.clone();
    next.status = status;

    if let Some(output_path) = patch.output_path {
        next.output_path = Some(output_path);
    }
    if let Some(download_url) = patch.download_url {
        next.download_url = Some(download_url);
    }
    if let Some(error) = patch.error {
        next.error = Some(error);
    }
    if let Some(input) = patch.input {
        next.input.extend(input);
    }

    match status {
        JobStatus::Completed => {
            if next.output_path.is_none() {
                return Err(StoreError::InvalidPatch {
                    id: next.id,
                    reason: "completed job requires an output path",
                });
            }
            if next.error.is_some() {
                return Err(StoreError::InvalidPatch {
                    id: next.id,
                    reason: "completed job cannot carry an error",
                });
            }
            next.progress = 100;
        }
        JobStatus::Failed => {
            if next.error.is_none() {
                return Err(StoreError::InvalidPatch {
                    id: next.id,
                    reason: "failed job requires an error tag",
                });
            }
            if next.output_path.is_some() || next.download_url.is_some() {
                return Err(StoreError::InvalidPatch {
                    id: next.id,
                    reason: "failed job cannot carry an output",
                });
            }
        }
        _ => {
            if next.output_path.is_some() || next.download_url.is_some() || next.error.is_some() {
                return Err(StoreError::InvalidPatch {
                    id: next.id,
                    reason: "only terminal jobs carry an output or error",
                });
            }
        }
    }

    if let Some(progress) = patch.progress {
        next.progress = next.progress.max(progress.min(100));
    }
    next.updated_at = Utc::now();
    Ok(next)
}
