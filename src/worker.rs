use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use serde_json::{json, Map};
use tokio::{fs, sync::Semaphore};
use tracing::{error, info, warn};

use crate::{
    artifact_store::{delete_file_if_exists, ensure_work_dir, job_output_path, ObjectStore},
    encoder::{EncodeOutcome, Encoder},
    models::{ExportJob, JobPatch},
    store::JobStore,
};

pub const FAILURE_TAG: &str = "ffmpeg_failed";
const START_PROGRESS: u8 = 5;
const PROGRESS_STEP: u8 = 5;
const PROGRESS_CAP: u8 = 95;

/// Renders export jobs and drives their records to a terminal status.
#[derive(Clone)]
pub struct ExportWorker {
    store: JobStore,
    encoder: Arc<Encoder>,
    objects: Option<ObjectStore>,
    work_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl ExportWorker {
    pub fn new(
        store: JobStore,
        encoder: Encoder,
        objects: Option<ObjectStore>,
        work_dir: PathBuf,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            encoder: Arc::new(encoder),
            objects,
            work_dir,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Runs `job_id` to completion and returns its terminal record.
    ///
    /// The job must already exist in the store. It stays `queued` until an
    /// encode permit is free, and only the caller that claims it encodes:
    /// others get `StoreError::Claimed` or `StoreError::Terminal`.
    pub async fn run(&self, job_id: &str) -> Result<ExportJob> {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("Export worker pool is closed")?;

        self.store.claim(job_id, START_PROGRESS).await?;
        info!(job_id = %job_id, progress = START_PROGRESS, "Export job started");

        ensure_work_dir(&self.work_dir).await?;
        let output_path = job_output_path(&self.work_dir, job_id);

        let mut progress = START_PROGRESS;
        let store = self.store.clone();
        let tick_id = job_id.to_string();
        let outcome = self
            .encoder
            .run(&output_path, || {
                progress = progress.saturating_add(PROGRESS_STEP).min(PROGRESS_CAP);
                let store = store.clone();
                let tick_id = tick_id.clone();
                let value = progress;
                async move {
                    if let Err(err) = store.update(&tick_id, JobPatch::progress(value)).await {
                        warn!(job_id = %tick_id, "Skipping progress update: {err}");
                    }
                }
            })
            .await;

        match outcome {
            Ok(EncodeOutcome::Succeeded) => self.complete(job_id, output_path).await,
            Ok(EncodeOutcome::Failed { exit_code }) => {
                warn!(job_id = %job_id, exit_code = ?exit_code, "Encoder exited with failure");
                self.fail(job_id, &output_path).await
            }
            Err(err) => {
                error!(job_id = %job_id, "Encoder could not run: {err:#}");
                self.fail(job_id, &output_path).await
            }
        }
    }

    async fn complete(&self, job_id: &str, output_path: PathBuf) -> Result<ExportJob> {
        let size_bytes = match fs::metadata(&output_path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                warn!(
                    job_id = %job_id,
                    "Encoder exited cleanly but {} is unreadable: {err}",
                    output_path.display()
                );
                return self.fail(job_id, &output_path).await;
            }
        };

        let download_url = self.publish(job_id, &output_path).await;

        let mut enriched = Map::new();
        enriched.insert("sizeBytes".to_string(), json!(size_bytes));
        let job = self
            .store
            .update(
                job_id,
                JobPatch::completed(
                    output_path.display().to_string(),
                    download_url.clone(),
                    enriched,
                ),
            )
            .await?;

        // Without a download link the local file is the only copy.
        if download_url.is_some() {
            if let Err(err) = delete_file_if_exists(&output_path).await {
                warn!(job_id = %job_id, "Failed removing local export: {err:#}");
            }
        }

        info!(
            job_id = %job_id,
            size_bytes,
            download_url = download_url.is_some(),
            "Export job completed"
        );
        Ok(job)
    }

    async fn publish(&self, job_id: &str, output_path: &std::path::Path) -> Option<String> {
        let objects = self.objects.as_ref()?;
        let file_name = output_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("export.bin");
        let key = format!("{job_id}/{file_name}");

        match objects.upload_and_sign(output_path, &key).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(job_id = %job_id, bucket = objects.bucket(), "Upload failed: {err:#}");
                None
            }
        }
    }

    async fn fail(&self, job_id: &str, output_path: &std::path::Path) -> Result<ExportJob> {
        if let Err(err) = delete_file_if_exists(output_path).await {
            warn!(job_id = %job_id, "Failed removing partial export: {err:#}");
        }
        let job = self
            .store
            .update(job_id, JobPatch::failed(FAILURE_TAG))
            .await?;
        info!(job_id = %job_id, progress = job.progress, "Export job failed");
        Ok(job)
    }
}
