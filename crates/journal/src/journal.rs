//! Append-only check-in journal stored next to the device pointers

use crate::Result;
use espota_core::store::atomic_write;
use espota_core::store::fs::{device_dir, DEVICES_DIR, TMP_DIR};
use espota_core::{AuditSink, DeviceIdentity, Error, Metadata, RequestEvent};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const INFO_FILE: &str = "info.json";
const REQUEST_LOG: &str = "request.log";

/// Filesystem audit sink sharing the store's data root
///
/// Holds no per-device state. `info.json` is replaced by rename and each
/// request record is a single append, so concurrent writers need no locks.
pub struct FileJournal {
    root: PathBuf,
    /// Records appended since open
    appended: AtomicU64,
}

impl FileJournal {
    /// Open or create a journal under `root`
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [DEVICES_DIR, TMP_DIR] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path)
                .map_err(|e| Error::storage("create journal", &path, e))?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            appended: AtomicU64::new(0),
        })
    }

    fn ensure_device_dir(&self, device: &DeviceIdentity) -> Result<PathBuf> {
        let dir = device_dir(&self.root, device);
        std::fs::create_dir_all(&dir).map_err(|e| Error::storage("create device dir", &dir, e))?;
        Ok(dir)
    }

    /// Last `limit` check-ins of a device, oldest first
    ///
    /// Lines that do not parse are skipped.
    pub fn requests(&self, device: &DeviceIdentity, limit: usize) -> Result<Vec<RequestEvent>> {
        let path = device_dir(&self.root, device).join(REQUEST_LOG);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage("read request log", &path, e)),
        };

        let mut events = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RequestEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping {}:{}: {}", path.display(), number + 1, e),
            }
        }

        let start = events.len().saturating_sub(limit);
        Ok(events.split_off(start))
    }

    /// Number of request records appended by this process
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }
}

fn to_json_line<T: serde::Serialize>(value: &T, path: &Path) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value).map_err(|e| {
        Error::storage("encode record", path, std::io::Error::new(ErrorKind::InvalidData, e))
    })?;
    line.push(b'\n');
    Ok(line)
}

impl AuditSink for FileJournal {
    fn record_device_info(&self, device: &DeviceIdentity, metadata: &Metadata) -> Result<()> {
        let path = self.ensure_device_dir(device)?.join(INFO_FILE);
        let data = to_json_line(metadata, &path)?;
        atomic_write(&self.root.join(TMP_DIR), &path, &data)
            .map_err(|e| Error::storage("write device info", &path, e))
    }

    fn record_request(&self, device: &DeviceIdentity, event: &RequestEvent) -> Result<()> {
        let path = self.ensure_device_dir(device)?.join(REQUEST_LOG);
        let line = to_json_line(event, &path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::storage("open request log", &path, e))?;
        // Whole record in one write so concurrent appenders never interleave
        file.write_all(&line)
            .map_err(|e| Error::storage("append request log", &path, e))?;

        let total = self.appended.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Journaled check-in #{} for {}", total, device);
        Ok(())
    }

    fn device_info(&self, device: &DeviceIdentity) -> Result<Option<Metadata>> {
        let path = device_dir(&self.root, device).join(INFO_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage("read device info", &path, e)),
        };

        let info = serde_json::from_slice(&raw).map_err(|e| {
            let e = std::io::Error::new(ErrorKind::InvalidData, e);
            Error::storage("parse device info", &path, e)
        })?;
        Ok(Some(info))
    }
}
