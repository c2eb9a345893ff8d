use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    artifact_store::guess_content_type,
    audit,
    error::{ApiError, StoreError},
    models::{ExportAcceptedResponse, ExportJob, ExportRequest, JobStatus, WebhookRequest},
    worker::FAILURE_TAG,
    AppState,
};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn create_export(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExportAcceptedResponse>, ApiError> {
    let request: ExportRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidPayload)?;
    let input = request.into_input().ok_or(ApiError::InvalidPayload)?;

    let job_id = Uuid::new_v4().to_string();
    state.store.put(ExportJob::queued(job_id.clone(), input)).await;
    audit::record(audit::JOB_QUEUED, &job_id);

    let worker = state.worker.clone();
    let background_id = job_id.clone();
    tokio::spawn(async move {
        match worker.run(&background_id).await {
            Ok(job) if job.status == JobStatus::Completed => {
                audit::record(audit::JOB_FINISHED, &background_id);
            }
            Ok(job) => {
                audit::record_failure(&background_id, job.error.as_deref().unwrap_or(FAILURE_TAG));
            }
            Err(err) if claimed_elsewhere(&err) => {
                info!(job_id = %background_id, "Export job already handled: {err}");
            }
            Err(err) => {
                error!(job_id = %background_id, "Export job aborted: {err:#}");
                audit::record_failure(&background_id, &err.to_string());
            }
        }
    });

    Ok(Json(ExportAcceptedResponse {
        job_id,
        status: JobStatus::Queued,
    }))
}

pub async fn get_export_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.store.get(&job_id).await.ok_or(ApiError::NotFound)?;
    Ok(Json(job.to_response()))
}

pub async fn export_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(err) = state.webhook.verify(&headers, &body) {
        warn!("Rejected export webhook: {err}");
        return Err(ApiError::InvalidSignature);
    }

    let request: WebhookRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidPayload)?;
    let job_id = request.job_id().ok_or(ApiError::MissingJobId)?;

    match state.store.get(&job_id).await {
        Some(existing) if existing.status.is_terminal() => return Ok(dedup_response(&job_id)),
        Some(existing) if existing.status == JobStatus::Running => {
            return Ok(in_progress_response(&job_id));
        }
        Some(_) => {}
        None => {
            state
                .store
                .put_if_absent(ExportJob::queued(job_id.clone(), request.input()))
                .await;
        }
    }

    let job = match state.worker.run(&job_id).await {
        Ok(job) => job,
        // Another caller claimed the job while this delivery waited for a permit.
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(StoreError::Terminal(_)) => return Ok(dedup_response(&job_id)),
            Some(StoreError::Claimed(_)) => return Ok(in_progress_response(&job_id)),
            _ => return Err(ApiError::Webhook(err)),
        },
    };

    if job.status == JobStatus::Completed {
        audit::record_completed(&job_id, job.download_url.is_some());
        Ok(Json(json!({
            "ok": true,
            "jobId": job_id,
            "outputPath": job.output_path,
            "downloadUrl": job.download_url,
            "sizeBytes": job.size_bytes(),
        })))
    } else {
        let error = job.error.as_deref().unwrap_or(FAILURE_TAG);
        audit::record_failure(&job_id, error);
        Ok(Json(json!({
            "ok": false,
            "jobId": job_id,
            "status": job.status,
            "error": error,
        })))
    }
}

fn dedup_response(job_id: &str) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "jobId": job_id, "dedup": true }))
}

fn in_progress_response(job_id: &str) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "jobId": job_id,
        "dedup": true,
        "status": JobStatus::Running,
    }))
}

fn claimed_elsewhere(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Terminal(_) | StoreError::Claimed(_))
    )
}

pub async fn download_export(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let objects = state.objects.as_ref().ok_or(ApiError::NotFound)?;
    let grant = objects.verify(&token).ok_or(ApiError::InvalidToken)?;

    let (path, bytes) = objects
        .read_object(&grant)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::NotFound)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("export.bin");
    let content_disposition = format!("attachment; filename=\"{file_name}\"");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, guess_content_type(&path))
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .body(Body::from(bytes))
        .map_err(|err| ApiError::Internal(err.into()))
}
