//! Filesystem-backed assignment store
//!
//! Layout under the data root:
//! ```text
//! apps/<app>/binaries/<name>.bin   binary bytes
//! apps/<app>/ACTIVE                name of the active binary
//! devices/<mac>/APP                name of the device's application
//! tmp/                             staging area for atomic writes
//! ```
//! Pointer files are only ever replaced through [`atomic_write`], so a
//! reader opening one sees the previous or the next name in full.

use super::{
    atomic_write, ApplicationSummary, AssignmentStore, BinaryImage, BinarySummary, DeviceSummary,
    KeyedLocks,
};
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::image::{binary_file_name, validate_name, ImageCheck};
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const APPS_DIR: &str = "apps";
pub const DEVICES_DIR: &str = "devices";
pub const TMP_DIR: &str = "tmp";
const BINARIES_DIR: &str = "binaries";
const ACTIVE_POINTER: &str = "ACTIVE";
const APP_POINTER: &str = "APP";

/// Directory holding everything recorded about one device
pub fn device_dir(root: &Path, device: &DeviceIdentity) -> PathBuf {
    root.join(DEVICES_DIR).join(device.storage_key())
}

pub struct FileSystemStore {
    root: PathBuf,
    image_check: ImageCheck,
    app_locks: KeyedLocks,
    device_locks: KeyedLocks,
}

impl FileSystemStore {
    /// Open the store at `root`, creating the directory skeleton if needed
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [APPS_DIR, DEVICES_DIR, TMP_DIR] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| Error::storage("create store", &path, e))?;
        }
        let root = std::fs::canonicalize(root).map_err(|e| Error::storage("open store", root, e))?;

        debug!("Opened filesystem store at {}", root.display());

        Ok(Self {
            root,
            image_check: ImageCheck::default(),
            app_locks: KeyedLocks::default(),
            device_locks: KeyedLocks::default(),
        })
    }

    pub fn with_image_check(mut self, image_check: ImageCheck) -> Self {
        self.image_check = image_check;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn app_dir(&self, application: &str) -> PathBuf {
        self.root.join(APPS_DIR).join(application)
    }

    fn require_app(&self, application: &str) -> Result<PathBuf> {
        validate_name(application)?;
        let dir = self.app_dir(application);
        if !dir.is_dir() {
            return Err(Error::UnknownApplication(application.to_string()));
        }
        Ok(dir)
    }

    fn write_pointer(&self, pointer: &Path, target: &str) -> Result<()> {
        atomic_write(&self.tmp_dir(), pointer, target.as_bytes())
            .map_err(|e| Error::storage("write pointer", pointer, e))
    }

    fn list_binaries(&self, app_dir: &Path) -> Result<Vec<BinarySummary>> {
        let dir = app_dir.join(BINARIES_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage("list binaries", &dir, e)),
        };

        let mut binaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage("list binaries", &dir, e))?;
            let metadata = entry
                .metadata()
                .map_err(|e| Error::storage("stat binary", entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            binaries.push(BinarySummary {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata
                    .modified()
                    .ok()
                    .map(|t| DateTime::<Utc>::from(t).trunc_subsecs(0)),
            });
        }
        binaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(binaries)
    }
}

/// Read a pointer file; a missing or empty file is no pointer
fn read_pointer(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let name = text.trim();
            Ok((!name.is_empty()).then(|| name.to_string()))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::storage("read pointer", path, e)),
    }
}

fn list_dir_names(dir: &Path, operation: &'static str) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::storage(operation, dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::storage(operation, dir, e))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

impl AssignmentStore for FileSystemStore {
    fn resolve_application(&self, device: &DeviceIdentity) -> Result<Option<String>> {
        read_pointer(&device_dir(&self.root, device).join(APP_POINTER))
    }

    fn resolve_active_binary(&self, application: &str) -> Result<Option<BinaryImage>> {
        validate_name(application)?;
        let app_dir = self.app_dir(application);

        let Some(active) = read_pointer(&app_dir.join(ACTIVE_POINTER))? else {
            return Ok(None);
        };
        let file_name = binary_file_name(&active)?;
        let path = app_dir.join(BINARIES_DIR).join(&file_name);

        // One read: the digest is computed from exactly these bytes
        match std::fs::read(&path) {
            Ok(content) => Ok(Some(BinaryImage::new(file_name, Bytes::from(content)))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Application {} points at missing binary {}",
                    application, file_name
                );
                Ok(None)
            }
            Err(e) => Err(Error::storage("read binary", &path, e)),
        }
    }

    fn create_application(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let lock = self.app_locks.get(name);
        let _guard = lock.lock();

        let binaries = self.app_dir(name).join(BINARIES_DIR);
        std::fs::create_dir_all(&binaries)
            .map_err(|e| Error::storage("create application", &binaries, e))?;

        info!("Created application {}", name);
        Ok(())
    }

    fn upload_binary(&self, application: &str, binary: &str, content: &[u8]) -> Result<String> {
        let file_name = binary_file_name(binary)?;
        self.image_check.validate(content)?;
        let app_dir = self.require_app(application)?;

        let lock = self.app_locks.get(application);
        let _guard = lock.lock();

        let binaries = app_dir.join(BINARIES_DIR);
        std::fs::create_dir_all(&binaries)
            .map_err(|e| Error::storage("create binaries dir", &binaries, e))?;

        let target = binaries.join(&file_name);
        atomic_write(&self.tmp_dir(), &target, content)
            .map_err(|e| Error::storage("write binary", &target, e))?;

        info!(
            "Stored binary {} for application {} ({} bytes)",
            file_name,
            application,
            content.len()
        );
        Ok(file_name)
    }

    fn set_active_binary(&self, application: &str, binary: &str) -> Result<()> {
        let file_name = binary_file_name(binary)?;
        let app_dir = self.require_app(application)?;

        let lock = self.app_locks.get(application);
        let _guard = lock.lock();

        if !app_dir.join(BINARIES_DIR).join(&file_name).is_file() {
            return Err(Error::UnknownBinary {
                application: application.to_string(),
                binary: file_name,
            });
        }

        self.write_pointer(&app_dir.join(ACTIVE_POINTER), &file_name)?;

        info!("Application {} now serves {}", application, file_name);
        Ok(())
    }

    fn set_device_application(&self, device: &DeviceIdentity, application: &str) -> Result<()> {
        self.require_app(application)?;

        let key = device.storage_key();
        let lock = self.device_locks.get(&key);
        let _guard = lock.lock();

        let dir = device_dir(&self.root, device);
        std::fs::create_dir_all(&dir).map_err(|e| Error::storage("create device dir", &dir, e))?;
        self.write_pointer(&dir.join(APP_POINTER), application)?;

        info!("Device {} assigned to application {}", device, application);
        Ok(())
    }

    fn list_applications(&self) -> Result<Vec<ApplicationSummary>> {
        let mut apps = Vec::new();
        for name in list_dir_names(&self.root.join(APPS_DIR), "list applications")? {
            let app_dir = self.app_dir(&name);
            apps.push(ApplicationSummary {
                active: read_pointer(&app_dir.join(ACTIVE_POINTER))?,
                binaries: self.list_binaries(&app_dir)?,
                name,
            });
        }
        Ok(apps)
    }

    fn image_check(&self) -> ImageCheck {
        self.image_check
    }

    fn list_devices(&self) -> Result<Vec<DeviceSummary>> {
        let mut devices = Vec::new();
        for name in list_dir_names(&self.root.join(DEVICES_DIR), "list devices")? {
            let Ok(identity) = DeviceIdentity::parse(&name) else {
                debug!("Skipping unrecognised device directory {}", name);
                continue;
            };
            devices.push(DeviceSummary {
                application: self.resolve_application(&identity)?,
                identity,
            });
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ContentDigest;
    use crate::image::IMAGE_MAGIC;
    use crate::resolver::{ContentResolver, Resolution};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn image(payload: &[u8]) -> Vec<u8> {
        let mut data = IMAGE_MAGIC.to_vec();
        data.extend_from_slice(payload);
        data
    }

    fn device(text: &str) -> DeviceIdentity {
        DeviceIdentity::parse(text).unwrap()
    }

    #[test]
    fn test_open_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        assert!(store.root().join(APPS_DIR).is_dir());
        assert!(store.root().join(DEVICES_DIR).is_dir());
        assert!(store.root().join(TMP_DIR).is_dir());
    }

    #[test]
    fn test_full_chain_resolves() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        let mac = device("18:FE:AA:AA:AA:AA");
        let data = image(b"v1");

        store.create_application("firmware-v1").unwrap();
        assert_eq!(store.upload_binary("firmware-v1", "a", &data).unwrap(), "a.bin");
        store.set_active_binary("firmware-v1", "a").unwrap();
        store.set_device_application(&mac, "firmware-v1").unwrap();

        assert_eq!(store.resolve_application(&mac).unwrap().as_deref(), Some("firmware-v1"));
        let active = store.resolve_active_binary("firmware-v1").unwrap().unwrap();
        assert_eq!(active.name, "a.bin");
        assert_eq!(&active.content[..], &data[..]);
        assert_eq!(active.digest, ContentDigest::of(&data));
    }

    #[test]
    fn test_unassigned_and_inactive() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();

        assert_eq!(store.resolve_application(&device("AA:AA:AA:AA:AA:AA")).unwrap(), None);
        assert!(store.resolve_active_binary("nope").unwrap().is_none());

        store.create_application("empty").unwrap();
        assert!(store.resolve_active_binary("empty").unwrap().is_none());
    }

    #[test]
    fn test_mutations_reject_unknown_targets() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        let mac = device("18:FE:AA:AA:AA:AA");

        assert!(matches!(
            store.set_device_application(&mac, "ghost"),
            Err(Error::UnknownApplication(_))
        ));
        assert!(matches!(
            store.upload_binary("ghost", "a", &image(b"x")),
            Err(Error::UnknownApplication(_))
        ));

        store.create_application("app").unwrap();
        assert!(matches!(
            store.set_active_binary("app", "missing"),
            Err(Error::UnknownBinary { .. })
        ));
        // A failed assignment leaves no trace
        assert_eq!(store.resolve_application(&mac).unwrap(), None);
    }

    #[test]
    fn test_upload_checks_magic() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        store.create_application("app").unwrap();

        assert!(matches!(
            store.upload_binary("app", "bad", b"\x00\x01\x02\x03\x04\x05\x06\x07 firmware"),
            Err(Error::InvalidImageFormat)
        ));
        assert!(!store.root().join("apps/app/binaries/bad.bin").exists());

        let lenient = FileSystemStore::open(temp_dir.path())
            .unwrap()
            .with_image_check(ImageCheck::Disabled);
        assert!(lenient.upload_binary("app", "raw", b"foobar").is_ok());
    }

    #[test]
    fn test_names_cannot_escape_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();

        assert!(matches!(store.create_application("../evil"), Err(Error::InvalidName(_))));
        assert!(matches!(store.create_application(".."), Err(Error::InvalidName(_))));
        store.create_application("app").unwrap();
        assert!(matches!(
            store.upload_binary("app", "../../x", &image(b"")),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_reupload_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        store.create_application("app").unwrap();
        store.upload_binary("app", "a.bin", &image(b"one")).unwrap();
        store.set_active_binary("app", "a.bin").unwrap();
        let first = store.resolve_active_binary("app").unwrap().unwrap().digest;

        store.upload_binary("app", "a.bin", &image(b"two")).unwrap();
        let second = store.resolve_active_binary("app").unwrap().unwrap().digest;

        assert_ne!(first, second);
        assert_eq!(second, ContentDigest::of(&image(b"two")));
    }

    #[test]
    fn test_reassign_device() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        let mac = device("18:FE:AA:AA:AA:AA");
        store.create_application("a").unwrap();
        store.create_application("b").unwrap();

        store.set_device_application(&mac, "a").unwrap();
        store.set_device_application(&mac, "b").unwrap();
        assert_eq!(store.resolve_application(&mac).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_listing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        store.create_application("beta").unwrap();
        store.create_application("alpha").unwrap();
        store.upload_binary("alpha", "x", &image(b"12345")).unwrap();
        store.set_active_binary("alpha", "x").unwrap();
        store.set_device_application(&device("18:FE:AA:AA:AA:AA"), "alpha").unwrap();
        std::fs::create_dir_all(store.root().join(DEVICES_DIR).join("not-a-mac")).unwrap();

        let apps = store.list_applications().unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "alpha");
        assert_eq!(apps[0].active.as_deref(), Some("x.bin"));
        assert_eq!(apps[0].binaries.len(), 1);
        assert_eq!(apps[0].binaries[0].size, (IMAGE_MAGIC.len() + 5) as u64);
        assert!(apps[1].binaries.is_empty());

        let devices = store.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identity, device("18:fe:aa:aa:aa:aa"));
        assert_eq!(devices[0].application.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mac = device("18:FE:AA:AA:AA:AA");
        {
            let store = FileSystemStore::open(temp_dir.path()).unwrap();
            store.create_application("app").unwrap();
            store.upload_binary("app", "a", &image(b"persist")).unwrap();
            store.set_active_binary("app", "a").unwrap();
            store.set_device_application(&mac, "app").unwrap();
        }

        let store = FileSystemStore::open(temp_dir.path()).unwrap();
        let app = store.resolve_application(&mac).unwrap().unwrap();
        let active = store.resolve_active_binary(&app).unwrap().unwrap();
        assert_eq!(active.digest, ContentDigest::of(&image(b"persist")));
    }

    #[test]
    fn test_active_swap_is_atomic_under_readers() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileSystemStore::open(temp_dir.path()).unwrap());
        let old = image(&vec![0x11; 64 * 1024]);
        let new = image(&vec![0x22; 64 * 1024]);
        let allowed = [ContentDigest::of(&old), ContentDigest::of(&new)];

        store.create_application("app").unwrap();
        store.upload_binary("app", "old", &old).unwrap();
        store.upload_binary("app", "new", &new).unwrap();
        store.set_active_binary("app", "old").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    let target = if flip { "old" } else { "new" };
                    store.set_active_binary("app", target).unwrap();
                    flip = !flip;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..300 {
                        let active = store
                            .resolve_active_binary("app")
                            .unwrap()
                            .expect("active binary never disappears during a swap");
                        assert!(allowed.contains(&active.digest));
                        assert_eq!(active.digest, ContentDigest::of(&active.content));
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn test_device_reassign_is_atomic_under_readers() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileSystemStore::open(temp_dir.path()).unwrap());
        let blue = image(b"blue");
        let green = image(b"green");
        let allowed = [ContentDigest::of(&blue), ContentDigest::of(&green)];

        for (app, content) in [("blue", &blue), ("green", &green)] {
            store.create_application(app).unwrap();
            store.upload_binary(app, "fw", content).unwrap();
            store.set_active_binary(app, "fw").unwrap();
        }
        let mac = device("18:FE:AA:AA:AA:AA");
        store.set_device_application(&mac, "blue").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    let target = if flip { "blue" } else { "green" };
                    store.set_device_application(&mac, target).unwrap();
                    flip = !flip;
                }
            })
        };

        let resolver = ContentResolver::new(store.clone());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let resolver = resolver.clone();
                thread::spawn(move || {
                    for _ in 0..300 {
                        match resolver.resolve(&mac).unwrap() {
                            Resolution::Content(resolved) => {
                                assert!(allowed.contains(&resolved.digest))
                            }
                            other => panic!("device lost its application: {other:?}"),
                        }
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
