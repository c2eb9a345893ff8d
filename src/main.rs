use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use beehive_export_api::{
    artifact_store::{ensure_work_dir, ObjectStore},
    auth::WebhookVerifier,
    build_router,
    config::{Config, WebhookSigning},
    encoder::Encoder,
    mirror::{database_path, SqliteMirror},
    store::JobStore,
    worker::ExportWorker,
    AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beehive_export_api=info,beehive=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    // The service is useless without an encoder; refuse to start rather than fail every job.
    let encoder = Encoder::locate()?;
    info!(encoder = %encoder.program().display(), "Encoder located");

    ensure_work_dir(&config.work_dir).await?;

    let store = match &config.database_url {
        Some(url) => {
            let mirror = SqliteMirror::open(Path::new(database_path(url)))
                .context("Failed to open job mirror")?;
            JobStore::with_mirror(Arc::new(mirror))
        }
        None => {
            info!("BEEHIVE_DATABASE_URL not set; export jobs are kept in memory only");
            JobStore::in_memory()
        }
    };

    let objects = config.storage.as_ref().map(|storage| {
        if storage.signing_secret_is_fallback {
            warn!("BEEHIVE_URL_SIGNING_SECRET not set; download links will not survive a restart");
        }
        ObjectStore::new(
            storage.root.clone(),
            storage.bucket.clone(),
            storage.signing_secret.clone(),
            storage.signed_url_secs,
            storage.public_base_url.clone(),
        )
    });
    if objects.is_none() {
        info!("BEEHIVE_STORAGE_ROOT not set; exports will not get download links");
    }

    let webhook = match &config.webhook_signing {
        WebhookSigning::Keys { current, next } => WebhookVerifier::Signed {
            current: current.clone(),
            next: next.clone(),
        },
        WebhookSigning::AllowUnsigned => {
            warn!("BEEHIVE_WEBHOOK_ALLOW_UNSIGNED is set; export webhooks are not authenticated");
            WebhookVerifier::Unsigned
        }
    };

    let worker = ExportWorker::new(
        store.clone(),
        encoder,
        objects.clone(),
        config.work_dir.clone(),
        config.max_concurrent_exports,
    );
    info!(
        mirrored = store.is_mirrored(),
        max_concurrent = config.max_concurrent_exports,
        work_dir = %config.work_dir.display(),
        "Export worker ready"
    );

    let app = build_router(AppState::new(worker, objects, webhook));

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("beehive-export-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
