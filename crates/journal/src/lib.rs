//! Per-device audit journal
//!
//! This crate provides the filesystem audit sink:
//! - `info.json`: latest metadata reported by a device, replaced atomically
//! - `request.log`: append-only JSON lines, one per check-in

pub mod journal;

// Re-exports
pub use journal::FileJournal;

/// Result type for journal operations
pub type Result<T> = espota_core::Result<T>;
