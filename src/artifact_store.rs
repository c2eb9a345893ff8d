use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::fs;

type HmacSha256 = Hmac<Sha256>;

pub async fn ensure_work_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create export work dir at {}", path.display()))
}

pub fn job_output_path(work_dir: &Path, job_id: &str) -> PathBuf {
    work_dir.join(format!("{job_id}.mp4"))
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadGrant {
    pub bucket: String,
    pub key: String,
    pub exp: i64,
}

/// Bucket-style object storage on the local filesystem with HMAC-signed
/// download links.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
    bucket: String,
    signing_secret: String,
    signed_url_secs: u64,
    public_base_url: String,
}

impl ObjectStore {
    pub fn new(
        root: PathBuf,
        bucket: impl Into<String>,
        signing_secret: impl Into<String>,
        signed_url_secs: u64,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            root,
            bucket: bucket.into(),
            signing_secret: signing_secret.into(),
            signed_url_secs,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !safe {
            anyhow::bail!("Refusing object key `{key}`");
        }
        Ok(self.root.join(bucket).join(relative))
    }

    /// Stores `local_path` under `key` (overwriting) and returns a signed download URL.
    pub async fn upload_and_sign(&self, local_path: &Path, key: &str) -> Result<String> {
        let target = self.object_path(&self.bucket, key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create bucket dir {}", parent.display()))?;
        }
        fs::copy(local_path, &target).await.with_context(|| {
            format!(
                "Failed to upload {} to {}",
                local_path.display(),
                target.display()
            )
        })?;

        let ttl = i64::try_from(self.signed_url_secs).unwrap_or(i64::MAX);
        let exp = Utc::now().timestamp().saturating_add(ttl);
        let token = self.sign(&DownloadGrant {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            exp,
        })?;
        Ok(format!("{}/api/export/download/{token}", self.public_base_url))
    }

    pub fn sign(&self, grant: &DownloadGrant) -> Result<String> {
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(grant).context("Failed to encode download grant")?);
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .context("Invalid URL signing secret")?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Returns the grant when the token is authentic and unexpired.
    pub fn verify(&self, token: &str) -> Option<DownloadGrant> {
        let (payload, signature) = token.split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes()).ok()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).ok()?;

        let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let grant: DownloadGrant = serde_json::from_slice(&bytes).ok()?;
        if grant.exp <= Utc::now().timestamp() {
            return None;
        }
        Some(grant)
    }

    /// Reads an object named by a verified grant. `Ok(None)` when it no longer exists.
    pub async fn read_object(&self, grant: &DownloadGrant) -> Result<Option<(PathBuf, Vec<u8>)>> {
        let path = self.object_path(&grant.bucket, &grant.key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some((path, bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}
