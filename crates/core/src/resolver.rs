//! Device identity → the binary it should be running

use crate::digest::ContentDigest;
use crate::error::Result;
use crate::identity::DeviceIdentity;
use crate::store::AssignmentStore;
use bytes::Bytes;
use std::sync::Arc;

/// Desired content of a device, digest and bytes from the same read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContent {
    pub application: String,
    pub binary: String,
    pub digest: ContentDigest,
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Content(ResolvedContent),
    /// Device has no application (unknown to the system)
    Unassigned,
    /// Application exists but designates no binary
    NoActiveBinary,
}

#[derive(Clone)]
pub struct ContentResolver {
    store: Arc<dyn AssignmentStore>,
}

impl ContentResolver {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AssignmentStore> {
        &self.store
    }

    pub fn resolve(&self, device: &DeviceIdentity) -> Result<Resolution> {
        let Some(application) = self.store.resolve_application(device)? else {
            return Ok(Resolution::Unassigned);
        };

        let Some(image) = self.store.resolve_active_binary(&application)? else {
            return Ok(Resolution::NoActiveBinary);
        };

        Ok(Resolution::Content(ResolvedContent {
            application,
            binary: image.name,
            digest: image.digest,
            content: image.content,
        }))
    }
}
