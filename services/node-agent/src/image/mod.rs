//! Root-disk images and per-workload snapshots.
//!
//! This module handles:
//! - Checking for and pulling base images
//! - Creating a writable snapshot of the base image for each workload
//! - Leases that keep a base image in use while a snapshot depends on it
//!
//! Snapshots and leases are keyed by workload ID.

mod local;
mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub use local::{LocalImageBackend, LocalImageConfig};
pub use memory::MemoryImageBackend;

/// Errors from the image backend.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The image or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("image fetch for {image} returned status {status}")]
    FetchStatus { image: String, status: u16 },
}

impl ImageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Where a snapshot can be attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSource {
    /// Block device or image file backing the snapshot.
    pub path: PathBuf,
}

/// Image and snapshot store.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Whether the image is present locally.
    async fn image_exists(&self, image_ref: &str) -> Result<bool, ImageError>;

    /// Fetch the image, replacing any local copy that no lease holds.
    async fn pull_image(&self, image_ref: &str) -> Result<(), ImageError>;

    /// Whether a snapshot exists for `key`.
    async fn snapshot_exists(&self, key: &str) -> Result<bool, ImageError>;

    /// Create a writable snapshot of `image_ref` under `key`.
    ///
    /// Returns the existing snapshot's mount if one already exists.
    async fn create_snapshot(&self, image_ref: &str, key: &str)
        -> Result<MountSource, ImageError>;

    /// Mount source of an existing snapshot.
    async fn snapshot_mount(&self, key: &str) -> Result<MountSource, ImageError>;

    /// Remove the snapshot for `key`. Removing a missing snapshot succeeds.
    async fn delete_snapshot(&self, key: &str) -> Result<(), ImageError>;

    /// Take a lease on `image_ref` for `key`. Idempotent.
    async fn create_lease(&self, key: &str, image_ref: &str) -> Result<(), ImageError>;

    /// Drop the lease for `key`. Dropping a missing lease succeeds.
    async fn delete_lease(&self, key: &str) -> Result<(), ImageError>;
}
