//! Audit records and the sink that receives them
//!
//! Recording is best effort. A sink failure is logged and never changes the
//! response a device gets.

use crate::error::Result;
use crate::identity::DeviceIdentity;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One metadata value reported by a device or added by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl MetaValue {
    /// Integers stay integers (free space, sketch size...), everything else is text
    pub fn from_header(value: &str) -> Self {
        match value.trim().parse::<i64>() {
            Ok(n) => MetaValue::Integer(n),
            Err(_) => MetaValue::Text(value.to_string()),
        }
    }
}

/// Device-reported fields keyed by lowercase header suffix (`free-space`, `sdk-version`...)
pub type Metadata = BTreeMap<String, MetaValue>;

/// What the handler decided for one check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    NotModified,
    Update,
    Rejected,
    Failed,
    /// An update was decided but the device went away before the image was sent
    Interrupted,
}

/// One line of a device's request log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub decision: Decision,
    /// HTTP status the decision maps to
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub metadata: Metadata,
}

pub trait AuditSink: Send + Sync {
    /// Replace the latest known metadata of a device
    fn record_device_info(&self, device: &DeviceIdentity, metadata: &Metadata) -> Result<()>;

    /// Append one check-in event
    fn record_request(&self, device: &DeviceIdentity, event: &RequestEvent) -> Result<()>;

    /// Latest metadata recorded for a device, for sinks that keep it
    fn device_info(&self, _device: &DeviceIdentity) -> Result<Option<Metadata>> {
        Ok(None)
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn record_device_info(&self, _device: &DeviceIdentity, _metadata: &Metadata) -> Result<()> {
        Ok(())
    }

    fn record_request(&self, _device: &DeviceIdentity, _event: &RequestEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps records in memory, for tests and `--memory` serving
#[derive(Debug, Default)]
pub struct MemoryAudit {
    info: Mutex<BTreeMap<DeviceIdentity, Metadata>>,
    requests: Mutex<Vec<(DeviceIdentity, RequestEvent)>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(DeviceIdentity, RequestEvent)> {
        self.requests.lock().clone()
    }
}

impl AuditSink for MemoryAudit {
    fn record_device_info(&self, device: &DeviceIdentity, metadata: &Metadata) -> Result<()> {
        self.info.lock().insert(*device, metadata.clone());
        Ok(())
    }

    fn record_request(&self, device: &DeviceIdentity, event: &RequestEvent) -> Result<()> {
        self.requests.lock().push((*device, event.clone()));
        Ok(())
    }

    fn device_info(&self, device: &DeviceIdentity) -> Result<Option<Metadata>> {
        Ok(self.info.lock().get(device).cloned())
    }
}
