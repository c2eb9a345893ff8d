use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use beehive_export_api::{
    artifact_store::ObjectStore,
    auth::{sign_body, WebhookVerifier, SIGNATURE_HEADER},
    build_router,
    encoder::Encoder,
    mirror::{JobMirror, SqliteMirror},
    store::JobStore,
    worker::ExportWorker,
    AppState,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const SIGNING_KEY: &str = "test-signing-key";

struct TestApp {
    router: Router,
    _dir: TempDir,
}

fn sh(script: &str) -> Encoder {
    Encoder::custom("sh", vec!["-c".to_string(), script.to_string()])
}

fn test_app(encoder: Encoder, with_storage: bool) -> TestApp {
    test_app_with(encoder, with_storage, 2, JobStore::in_memory())
}

fn test_app_with(
    encoder: Encoder,
    with_storage: bool,
    max_concurrent: usize,
    store: JobStore,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let objects = with_storage.then(|| {
        ObjectStore::new(dir.path().join("objects"), "beeswarm-exports", "url-secret", 60, "")
    });
    let worker = ExportWorker::new(
        store,
        encoder,
        objects.clone(),
        dir.path().join("work"),
        max_concurrent,
    );
    let webhook = WebhookVerifier::Signed {
        current: SIGNING_KEY.to_string(),
        next: None,
    };

    TestApp {
        router: build_router(AppState::new(worker, objects, webhook)),
        _dir: dir,
    }
}

/// Appends one `start` line to `log` per encode, then renders slowly.
fn logging_encoder(log: &Path) -> Encoder {
    sh(&format!(
        "echo start >> '{}'; sleep 0.3; printf rendered > \"$0\"",
        log.display()
    ))
}

fn encode_count(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .filter(|line| *line == "start")
        .count()
}

fn succeeding_encoder() -> Encoder {
    sh("echo frame >&2; sleep 0.05; echo frame >&2; printf rendered > \"$0\"")
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn signed_webhook(body: &Value) -> Request<Body> {
    let raw = body.to_string();
    Request::post("/api/export/webhook")
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, sign_body(SIGNING_KEY, raw.as_bytes()).unwrap())
        .body(Body::from(raw))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn poll_until_terminal(router: &Router, job_id: &str) -> Vec<Value> {
    let mut snapshots = Vec::new();
    for _ in 0..200 {
        let (status, body) = send(router, get(&format!("/api/export/status/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        let terminal = matches!(body["status"].as_str(), Some("completed" | "failed"));
        snapshots.push(body);
        if terminal {
            return snapshots;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached a terminal status");
}

#[tokio::test]
async fn enqueue_returns_queued_job_id() {
    let app = test_app(succeeding_encoder(), false);
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/export",
            &json!({ "composition": { "width": 1280, "height": 720 }, "tracks": [] }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert!(body["jobId"].as_str().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn enqueued_job_ids_are_unique() {
    let app = test_app(succeeding_encoder(), false);
    let mut ids = HashSet::new();
    for _ in 0..10 {
        let (_, body) = send(
            &app.router,
            post_json("/api/export", &json!({ "composition": {}, "tracks": ["a"] })),
        )
        .await;
        ids.insert(body["jobId"].as_str().unwrap().to_string());
    }
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn enqueue_rejects_malformed_payloads() {
    let app = test_app(succeeding_encoder(), false);

    for payload in [
        json!({ "tracks": [] }),
        json!({ "composition": null, "tracks": [] }),
        json!({ "composition": "", "tracks": [] }),
        json!({ "composition": false, "tracks": [] }),
        json!({ "composition": 0, "tracks": [] }),
        json!({ "composition": {}, "tracks": "intro,outro" }),
        json!({ "composition": {} }),
    ] {
        let (status, body) = send(&app.router, post_json("/api/export", &payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "payload {payload}");
        assert_eq!(body["error"], "invalid_payload");
    }

    let not_json = Request::post("/api/export")
        .body(Body::from("composition=yes"))
        .unwrap();
    let (status, body) = send(&app.router, not_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_payload");
}

#[tokio::test]
async fn unknown_status_is_not_found() {
    let app = test_app(succeeding_encoder(), false);
    let (status, body) = send(&app.router, get("/api/export/status/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "ok": false, "error": "not_found" }));
}

#[tokio::test]
async fn enqueued_job_progresses_to_completion() {
    let app = test_app(succeeding_encoder(), false);
    let (_, body) = send(
        &app.router,
        post_json("/api/export", &json!({ "composition": { "width": 1280 }, "tracks": [] })),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let snapshots = poll_until_terminal(&app.router, &job_id).await;
    let progress: Vec<u64> = snapshots
        .iter()
        .map(|s| s["progress"].as_u64().unwrap())
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "completed");
    assert_eq!(last["progress"], 100);
    assert_eq!(last["sizeBytes"], 8);
    assert!(last["outputPath"].as_str().unwrap().ends_with(".mp4"));
    assert!(last["error"].is_null());
}

#[tokio::test]
async fn enqueued_job_failure_is_visible_in_status() {
    let app = test_app(sh("echo nope >&2; exit 1"), false);
    let (_, body) = send(
        &app.router,
        post_json("/api/export", &json!({ "composition": {}, "tracks": [] })),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let last = poll_until_terminal(&app.router, &job_id).await.pop().unwrap();
    assert_eq!(last["status"], "failed");
    assert_eq!(last["error"], "ffmpeg_failed");
    assert!(last["outputPath"].is_null());
}

#[tokio::test]
async fn webhook_runs_job_inline_and_dedups_repeats() {
    let app = test_app(succeeding_encoder(), true);
    let delivery = json!({ "jobId": "hook-1", "payload": { "composition": "promo" } });

    let (status, first) = send(&app.router, signed_webhook(&delivery)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["ok"], true);
    assert_eq!(first["jobId"], "hook-1");
    assert_eq!(first["sizeBytes"], 8);
    assert!(first["outputPath"].as_str().unwrap().ends_with("hook-1.mp4"));
    assert!(first["downloadUrl"].as_str().is_some());

    let (_, before) = send(&app.router, get("/api/export/status/hook-1")).await;
    assert_eq!(before["status"], "completed");

    let (status, second) = send(&app.router, signed_webhook(&delivery)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, json!({ "ok": true, "jobId": "hook-1", "dedup": true }));

    let (_, after) = send(&app.router, get("/api/export/status/hook-1")).await;
    assert_eq!(after["updatedAt"], before["updatedAt"]);
    assert_eq!(after["downloadUrl"], before["downloadUrl"]);
    assert_eq!(after["outputPath"], before["outputPath"]);
}

#[tokio::test]
async fn webhook_download_url_serves_the_export() {
    let app = test_app(succeeding_encoder(), true);
    let (_, body) = send(
        &app.router,
        signed_webhook(&json!({ "jobId": "hook-dl", "payload": {} })),
    )
    .await;
    let url = body["downloadUrl"].as_str().unwrap().to_string();

    let response = app.router.clone().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/mp4");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"rendered");

    let (status, body) = send(&app.router, get(&format!("{url}x"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "invalid_token");
}

async fn enqueue(router: &Router) -> String {
    let (_, body) = send(
        router,
        post_json("/api/export", &json!({ "composition": {}, "tracks": [] })),
    )
    .await;
    body["jobId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn webhook_for_running_job_does_not_encode_again() {
    let logs = tempfile::tempdir().unwrap();
    let log = logs.path().join("encodes.log");
    let app = test_app(logging_encoder(&log), false);
    let job_id = enqueue(&app.router).await;

    for _ in 0..100 {
        let (_, body) = send(&app.router, get(&format!("/api/export/status/{job_id}"))).await;
        if body["status"] == "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, body) = send(
        &app.router,
        signed_webhook(&json!({ "jobId": job_id, "payload": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "ok": true, "jobId": job_id, "dedup": true, "status": "running" })
    );

    let last = poll_until_terminal(&app.router, &job_id).await.pop().unwrap();
    assert_eq!(last["status"], "completed");
    assert_eq!(encode_count(&log), 1);
}

#[tokio::test]
async fn webhook_waiting_behind_the_worker_dedups_once_it_finishes() {
    let logs = tempfile::tempdir().unwrap();
    let log = logs.path().join("encodes.log");
    let app = test_app_with(logging_encoder(&log), false, 1, JobStore::in_memory());

    let busy = enqueue(&app.router).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let waiting = enqueue(&app.router).await;
    // Let the background task for `waiting` queue on the permit first.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_, snapshot) = send(&app.router, get(&format!("/api/export/status/{waiting}"))).await;
    assert_eq!(snapshot["status"], "queued");

    let (status, body) = send(
        &app.router,
        signed_webhook(&json!({ "jobId": waiting, "payload": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "jobId": waiting, "dedup": true }));

    let (_, done) = send(&app.router, get(&format!("/api/export/status/{waiting}"))).await;
    assert_eq!(done["status"], "completed");
    poll_until_terminal(&app.router, &busy).await;
    assert_eq!(encode_count(&log), 2);
}

#[tokio::test]
async fn restarted_app_reads_jobs_back_from_the_mirror() {
    let db = tempfile::tempdir().unwrap();
    let mirror: Arc<dyn JobMirror> =
        Arc::new(SqliteMirror::open(&db.path().join("jobs.db")).unwrap());

    let first = test_app_with(
        succeeding_encoder(),
        false,
        2,
        JobStore::with_mirror(mirror.clone()),
    );
    let delivery = json!({ "jobId": "hook-restart", "payload": { "composition": "promo" } });
    let (_, completed) = send(&first.router, signed_webhook(&delivery)).await;
    assert_eq!(completed["ok"], true);

    let restarted = test_app_with(succeeding_encoder(), false, 2, JobStore::with_mirror(mirror));
    let (status, snapshot) = send(&restarted.router, get("/api/export/status/hook-restart")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["status"], "completed");
    assert_eq!(snapshot["outputPath"], completed["outputPath"]);
    assert_eq!(snapshot["sizeBytes"], 8);

    let (_, redelivered) = send(&restarted.router, signed_webhook(&delivery)).await;
    assert_eq!(
        redelivered,
        json!({ "ok": true, "jobId": "hook-restart", "dedup": true })
    );
}

#[tokio::test]
async fn webhook_requires_job_id() {
    let app = test_app(succeeding_encoder(), false);
    let (status, body) = send(&app.router, signed_webhook(&json!({ "payload": {} }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "ok": false, "error": "missing_jobId" }));
}

#[tokio::test]
async fn webhook_rejects_bad_signatures() {
    let app = test_app(succeeding_encoder(), false);
    let body = json!({ "jobId": "hook-2" }).to_string();

    let unsigned = Request::post("/api/export/webhook")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, response) = send(&app.router, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "invalid_signature");

    let forged = Request::post("/api/export/webhook")
        .header(SIGNATURE_HEADER, sign_body("wrong-key", body.as_bytes()).unwrap())
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(&app.router, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app.router, get("/api/export/status/hook-2")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_reports_failed_encode() {
    let app = test_app(sh("exit 7"), false);
    let (status, body) = send(
        &app.router,
        signed_webhook(&json!({ "jobId": "hook-3", "payload": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "ffmpeg_failed");

    let (_, snapshot) = send(&app.router, get("/api/export/status/hook-3")).await;
    assert_eq!(snapshot["status"], "failed");
    assert!(snapshot["outputPath"].is_null());
    assert!(snapshot["downloadUrl"].is_null());
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = test_app(succeeding_encoder(), false);
    let (status, body) = send(&app.router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}
