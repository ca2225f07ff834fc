//! On-disk image backend.
//!
//! Layout under the data directory:
//!
//! ```text
//! images/{sha256(ref)[..32]}.ext4             base root disks
//! snapshots/{key}-{sha256(key)[..16]}.ext4   per-workload writable copies
//! tmp/                                       partial downloads and copies
//! ```
//!
//! Base images are fetched from an HTTP mirror that serves the root disk for
//! `ref` at `{mirror}/{ref}`. Files are written to `tmp/` and renamed into
//! place, so a crashed pull or copy never leaves a truncated image behind.
//! A leased base image is never replaced by a pull.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ImageBackend, ImageError, MountSource};

/// Configuration for the on-disk backend.
#[derive(Debug, Clone)]
pub struct LocalImageConfig {
    pub images_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub tmp_dir: PathBuf,
    /// Base URL of the image mirror.
    pub mirror_url: String,
    /// Timeout for a whole image download.
    pub fetch_timeout: Duration,
}

impl LocalImageConfig {
    /// Standard layout under `data_dir`.
    pub fn under(data_dir: &Path, mirror_url: &str) -> Self {
        Self {
            images_dir: data_dir.join("images"),
            snapshots_dir: data_dir.join("snapshots"),
            tmp_dir: data_dir.join("tmp"),
            mirror_url: mirror_url.trim_end_matches('/').to_string(),
            fetch_timeout: Duration::from_secs(600),
        }
    }
}

/// A lease pinning a base image.
#[derive(Debug, Clone)]
struct Lease {
    image_ref: String,
    created_at: Instant,
}

/// Image backend storing root disks as files.
pub struct LocalImageBackend {
    config: LocalImageConfig,
    client: reqwest::Client,
    /// Leases keyed by workload ID.
    leases: RwLock<HashMap<String, Lease>>,
    /// Counter for unique temporary file names.
    tmp_counter: AtomicU64,
}

impl LocalImageBackend {
    /// Create the backend and its directories.
    pub async fn new(config: LocalImageConfig) -> Result<Self, ImageError> {
        for dir in [&config.images_dir, &config.snapshots_dir, &config.tmp_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;

        Ok(Self {
            config,
            client,
            leases: RwLock::new(HashMap::new()),
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Path of the base root disk for `image_ref`.
    pub fn image_path(&self, image_ref: &str) -> PathBuf {
        let digest = Sha256::digest(image_ref.as_bytes());
        self.config
            .images_dir
            .join(format!("{}.ext4", hex::encode(&digest[..16])))
    }

    /// Path of the snapshot for `key`.
    ///
    /// The readable prefix is lossy; the digest keeps distinct keys apart.
    pub fn snapshot_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.config
            .snapshots_dir
            .join(format!("{name}-{}.ext4", hex::encode(&digest[..8])))
    }

    /// Number of active leases on `image_ref`.
    pub async fn lease_count(&self, image_ref: &str) -> usize {
        self.leases
            .read()
            .await
            .values()
            .filter(|l| l.image_ref == image_ref)
            .count()
    }

    async fn is_leased(&self, image_ref: &str) -> bool {
        self.leases
            .read()
            .await
            .values()
            .any(|l| l.image_ref == image_ref)
    }

    fn tmp_path(&self, stem: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.config.tmp_dir.join(format!("{stem}.{n}.partial"))
    }
}

async fn exists(path: &Path) -> Result<bool, ImageError> {
    Ok(tokio::fs::try_exists(path).await?)
}

#[async_trait]
impl ImageBackend for LocalImageBackend {
    async fn image_exists(&self, image_ref: &str) -> Result<bool, ImageError> {
        exists(&self.image_path(image_ref)).await
    }

    async fn pull_image(&self, image_ref: &str) -> Result<(), ImageError> {
        let url = format!("{}/{}", self.config.mirror_url, image_ref);
        let target = self.image_path(image_ref);
        if self.is_leased(image_ref).await && exists(&target).await? {
            debug!(image = %image_ref, "Image is leased, keeping local copy");
            return Ok(());
        }

        let tmp = self.tmp_path("image");
        let started = Instant::now();

        info!(image = %image_ref, url = %url, "Pulling image");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ImageError::NotFound(image_ref.to_string()));
        }
        if !status.is_success() {
            return Err(ImageError::FetchStatus {
                image: image_ref.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        let mut size = 0u64;
        let written: Result<(), ImageError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp, &target).await?;

        info!(
            image = %image_ref,
            size_bytes = size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image pulled"
        );
        Ok(())
    }

    async fn snapshot_exists(&self, key: &str) -> Result<bool, ImageError> {
        exists(&self.snapshot_path(key)).await
    }

    async fn create_snapshot(
        &self,
        image_ref: &str,
        key: &str,
    ) -> Result<MountSource, ImageError> {
        let target = self.snapshot_path(key);
        if exists(&target).await? {
            debug!(key = %key, "Snapshot already exists");
            return Ok(MountSource { path: target });
        }

        let base = self.image_path(image_ref);
        if !exists(&base).await? {
            return Err(ImageError::NotFound(image_ref.to_string()));
        }

        let tmp = self.tmp_path("snapshot");
        if let Err(e) = tokio::fs::copy(&base, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &target).await?;

        info!(key = %key, image = %image_ref, path = %target.display(), "Snapshot created");
        Ok(MountSource { path: target })
    }

    async fn snapshot_mount(&self, key: &str) -> Result<MountSource, ImageError> {
        let path = self.snapshot_path(key);
        if !exists(&path).await? {
            return Err(ImageError::NotFound(key.to_string()));
        }
        Ok(MountSource { path })
    }

    async fn delete_snapshot(&self, key: &str) -> Result<(), ImageError> {
        match tokio::fs::remove_file(self.snapshot_path(key)).await {
            Ok(()) => {
                info!(key = %key, "Snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, key: &str, image_ref: &str) -> Result<(), ImageError> {
        let mut leases = self.leases.write().await;
        leases.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, image = %image_ref, "Lease created");
            Lease {
                image_ref: image_ref.to_string(),
                created_at: Instant::now(),
            }
        });
        Ok(())
    }

    async fn delete_lease(&self, key: &str) -> Result<(), ImageError> {
        if let Some(lease) = self.leases.write().await.remove(key) {
            debug!(
                key = %key,
                image = %lease.image_ref,
                held_secs = lease.created_at.elapsed().as_secs(),
                "Lease released"
            );
        }
        Ok(())
    }
}
