//! In-memory image backend for the mock runtime and tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::{ImageBackend, ImageError, MountSource};

#[derive(Debug, Default)]
struct State {
    images: HashSet<String>,
    /// Snapshot key -> image it was taken from.
    snapshots: HashMap<String, String>,
    /// Lease key -> image.
    leases: HashMap<String, String>,
    /// Images that fail to pull.
    unavailable: HashSet<String>,
}

/// Image backend that only tracks names.
///
/// Pulls succeed instantly unless the image was marked unavailable.
#[derive(Debug, Default)]
pub struct MemoryImageBackend {
    state: Mutex<State>,
    pulls: AtomicU64,
}

impl MemoryImageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a locally present image.
    pub fn with_image(self, image_ref: &str) -> Self {
        self.lock().images.insert(image_ref.to_string());
        self
    }

    /// Seed an existing snapshot.
    pub fn with_snapshot(self, key: &str, image_ref: &str) -> Self {
        self.lock()
            .snapshots
            .insert(key.to_string(), image_ref.to_string());
        self
    }

    /// Make pulls of `image_ref` fail with not-found.
    pub fn set_unavailable(&self, image_ref: &str) {
        self.lock().unavailable.insert(image_ref.to_string());
    }

    pub fn pull_count(&self) -> u64 {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn has_lease(&self, key: &str) -> bool {
        self.lock().leases.contains_key(key)
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mount(key: &str) -> MountSource {
        MountSource {
            path: PathBuf::from(format!("/dev/mock/{key}")),
        }
    }
}

#[async_trait]
impl ImageBackend for MemoryImageBackend {
    async fn image_exists(&self, image_ref: &str) -> Result<bool, ImageError> {
        Ok(self.lock().images.contains(image_ref))
    }

    async fn pull_image(&self, image_ref: &str) -> Result<(), ImageError> {
        let mut state = self.lock();
        if state.unavailable.contains(image_ref) {
            return Err(ImageError::NotFound(image_ref.to_string()));
        }
        state.images.insert(image_ref.to_string());
        self.pulls.fetch_add(1, Ordering::SeqCst);
        info!(image = %image_ref, "[MOCK] Pulled image");
        Ok(())
    }

    async fn snapshot_exists(&self, key: &str) -> Result<bool, ImageError> {
        Ok(self.lock().snapshots.contains_key(key))
    }

    async fn create_snapshot(
        &self,
        image_ref: &str,
        key: &str,
    ) -> Result<MountSource, ImageError> {
        let mut state = self.lock();
        if !state.snapshots.contains_key(key) {
            if !state.images.contains(image_ref) {
                return Err(ImageError::NotFound(image_ref.to_string()));
            }
            state
                .snapshots
                .insert(key.to_string(), image_ref.to_string());
        }
        Ok(Self::mount(key))
    }

    async fn snapshot_mount(&self, key: &str) -> Result<MountSource, ImageError> {
        if self.lock().snapshots.contains_key(key) {
            Ok(Self::mount(key))
        } else {
            Err(ImageError::NotFound(key.to_string()))
        }
    }

    async fn delete_snapshot(&self, key: &str) -> Result<(), ImageError> {
        self.lock().snapshots.remove(key);
        Ok(())
    }

    async fn create_lease(&self, key: &str, image_ref: &str) -> Result<(), ImageError> {
        self.lock()
            .leases
            .entry(key.to_string())
            .or_insert_with(|| image_ref.to_string());
        Ok(())
    }

    async fn delete_lease(&self, key: &str) -> Result<(), ImageError> {
        self.lock().leases.remove(key);
        Ok(())
    }
}
