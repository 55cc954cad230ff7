//! espota core - firmware update decisions for ESP8266/ESP32 devices
//!
//! This crate provides:
//! - Device identity and MD5 digest codecs
//! - The assignment store (device → application → active binary) with
//!   filesystem and in-memory adapters
//! - Content resolution for a device
//! - The check-in handler deciding between no-op, update and reject
//! - The audit sink interface

pub mod audit;
pub mod checkin;
pub mod digest;
pub mod error;
pub mod identity;
pub mod image;
pub mod resolver;
pub mod store;

// Re-export main types for convenience
pub use audit::{AuditSink, Decision, MemoryAudit, MetaValue, Metadata, NullAudit, RequestEvent};
pub use checkin::{
    AuditTrail, Checkin, CheckinHandler, CheckinRequest, CheckinResponse, HeaderNames,
    DIGEST_RESPONSE_HEADER,
};
pub use digest::ContentDigest;
pub use error::{Error, ErrorKind, Result};
pub use identity::DeviceIdentity;
pub use image::{ImageCheck, IMAGE_MAGIC};
pub use resolver::{ContentResolver, Resolution, ResolvedContent};
pub use store::{AssignmentStore, BinaryImage, FileSystemStore, MemoryStore};
