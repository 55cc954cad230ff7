//! Assignment store: device → application → active binary
//!
//! Both links are single pointers. Retargeting a device touches one device
//! record; rolling out a new image to every device of an application touches
//! one application record. Readers observe either the old or the new pointer,
//! never a missing one.

pub mod fs;
pub mod memory;

use crate::digest::ContentDigest;
use crate::error::Result;
use crate::identity::DeviceIdentity;
use crate::image::ImageCheck;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub use fs::FileSystemStore;
pub use memory::MemoryStore;

/// The bytes of one binary together with the digest computed from them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    pub name: String,
    pub digest: ContentDigest,
    pub content: Bytes,
}

impl BinaryImage {
    pub fn new(name: impl Into<String>, content: Bytes) -> Self {
        let digest = ContentDigest::of(&content);
        Self {
            name: name.into(),
            digest,
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BinarySummary {
    pub name: String,
    pub size: u64,
    /// Whole seconds, UTC
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSummary {
    pub name: String,
    pub active: Option<String>,
    pub binaries: Vec<BinarySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub identity: DeviceIdentity,
    pub application: Option<String>,
}

/// Durable device/application/binary relations
///
/// All operations may be called concurrently. Mutations are serialized per
/// target key and are atomic with respect to the read operations.
pub trait AssignmentStore: Send + Sync {
    /// Application the device follows, if any
    fn resolve_application(&self, device: &DeviceIdentity) -> Result<Option<String>>;

    /// Active binary of `application`, read in one go with its digest
    ///
    /// `None` for an unknown application or one without an active binary.
    fn resolve_active_binary(&self, application: &str) -> Result<Option<BinaryImage>>;

    /// Create an application; succeeds if it already exists
    fn create_application(&self, name: &str) -> Result<()>;

    /// Store `content` as `binary` in `application`, replacing a previous
    /// binary of the same name. Returns the normalized binary name.
    fn upload_binary(&self, application: &str, binary: &str, content: &[u8]) -> Result<String>;

    /// Point `application` at one of its binaries
    fn set_active_binary(&self, application: &str, binary: &str) -> Result<()>;

    /// Point `device` at an existing application
    fn set_device_application(&self, device: &DeviceIdentity, application: &str) -> Result<()>;

    fn list_applications(&self) -> Result<Vec<ApplicationSummary>>;

    fn list_devices(&self) -> Result<Vec<DeviceSummary>>;

    /// Check `upload_binary` applies to content
    fn image_check(&self) -> ImageCheck;
}

/// Per-key mutexes for administrative writes
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub(crate) fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Atomic write helper
///
/// Writes data to a uniquely named file in `tmp_dir`, fsyncs it, renames it
/// over `target` and fsyncs the parent directory. `tmp_dir` must be on the
/// same filesystem as `target`.
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = tmp_dir.join(format!("{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, target)?;
        sync_parent(target)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(unix)]
fn sync_parent(target: &Path) -> std::io::Result<()> {
    match target.parent() {
        Some(parent) => File::open(parent)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) -> std::io::Result<()> {
    Ok(())
}
