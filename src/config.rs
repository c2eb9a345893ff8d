use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::Result;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub bucket: String,
    pub signed_url_secs: u64,
    pub signing_secret: String,
    pub signing_secret_is_fallback: bool,
    pub public_base_url: String,
}

#[derive(Debug, Clone)]
pub enum WebhookSigning {
    Keys {
        current: String,
        next: Option<String>,
    },
    AllowUnsigned,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub work_dir: PathBuf,
    pub max_concurrent_exports: usize,
    pub storage: Option<StorageConfig>,
    pub webhook_signing: WebhookSigning,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = var("BEEHIVE_BIND_ADDR")
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let database_url = var("BEEHIVE_DATABASE_URL");

        let work_dir = var("BEEHIVE_EXPORT_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("beeswarm-exports"));

        let max_concurrent_exports = var("BEEHIVE_MAX_CONCURRENT_EXPORTS")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(2);

        let storage = var("BEEHIVE_STORAGE_ROOT").map(|root| {
            let (signing_secret, signing_secret_is_fallback) =
                match var("BEEHIVE_URL_SIGNING_SECRET") {
                    Some(secret) => (secret, false),
                    None => (format!("fallback-{}", Uuid::new_v4()), true),
                };
            StorageConfig {
                root: PathBuf::from(root),
                bucket: var("BEEHIVE_STORAGE_BUCKET")
                    .unwrap_or_else(|| "beeswarm-exports".to_string()),
                signed_url_secs: var("BEEHIVE_SIGNED_URL_SECS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(3600),
                signing_secret,
                signing_secret_is_fallback,
                public_base_url: var("BEEHIVE_PUBLIC_BASE_URL").unwrap_or_default(),
            }
        });

        let allow_unsigned = var("BEEHIVE_WEBHOOK_ALLOW_UNSIGNED")
            .map(|v| {
                matches!(
                    v.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);

        let webhook_signing = match var("BEEHIVE_WEBHOOK_SIGNING_KEY") {
            Some(current) => WebhookSigning::Keys {
                current,
                next: var("BEEHIVE_WEBHOOK_NEXT_SIGNING_KEY"),
            },
            None if allow_unsigned => WebhookSigning::AllowUnsigned,
            None => anyhow::bail!(
                "BEEHIVE_WEBHOOK_SIGNING_KEY is required; set BEEHIVE_WEBHOOK_ALLOW_UNSIGNED=true to accept unsigned webhooks"
            ),
        };

        Ok(Self {
            bind_addr,
            database_url,
            work_dir,
            max_concurrent_exports,
            storage,
            webhook_signing,
        })
    }
}
