//! Coarse audit events for the export lifecycle, emitted on the
//! `beehive::audit` tracing target so they can be routed separately.

use tracing::info;

pub const JOB_QUEUED: &str = "export.job.queued";
pub const JOB_FINISHED: &str = "export.job.finished";
pub const JOB_FAILED: &str = "export.job.failed";
pub const JOB_COMPLETED: &str = "export.job.completed";

pub fn record(event: &'static str, job_id: &str) {
    info!(target: "beehive::audit", event, job_id = %job_id, "audit");
}

pub fn record_failure(job_id: &str, error: &str) {
    info!(target: "beehive::audit", event = JOB_FAILED, job_id = %job_id, error = %error, "audit");
}

pub fn record_completed(job_id: &str, has_download_url: bool) {
    info!(
        target: "beehive::audit",
        event = JOB_COMPLETED,
        job_id = %job_id,
        download_url = has_download_url,
        "audit"
    );
}
