//! In-memory assignment store
//!
//! All state sits behind one `RwLock`, so every mutation is a single swap as
//! seen by readers. Binary bytes are `Bytes` and are shared, not copied, on
//! resolution.

use super::{ApplicationSummary, AssignmentStore, BinaryImage, BinarySummary, DeviceSummary};
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::image::{binary_file_name, validate_name, ImageCheck};
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
struct Application {
    binaries: BTreeMap<String, StoredBinary>,
    active: Option<String>,
}

struct StoredBinary {
    image: BinaryImage,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    applications: BTreeMap<String, Application>,
    devices: BTreeMap<DeviceIdentity, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    image_check: ImageCheck,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image_check(mut self, image_check: ImageCheck) -> Self {
        self.image_check = image_check;
        self
    }

    /// Give `device` its own application holding exactly `content`
    ///
    /// Shortcut for seeding a throwaway server from `MAC=FILE` pairs; the
    /// application is named after the device.
    pub fn add_device(&self, device: &DeviceIdentity, content: Bytes) -> Result<()> {
        let application = format!("device-{}", hex::encode(device.as_bytes()));
        self.create_application(&application)?;
        let binary = self.upload_binary(&application, "sketch", &content)?;
        self.set_active_binary(&application, &binary)?;
        self.set_device_application(device, &application)
    }
}

impl AssignmentStore for MemoryStore {
    fn resolve_application(&self, device: &DeviceIdentity) -> Result<Option<String>> {
        Ok(self.state.read().devices.get(device).cloned())
    }

    fn resolve_active_binary(&self, application: &str) -> Result<Option<BinaryImage>> {
        let state = self.state.read();
        let image = state.applications.get(application).and_then(|app| {
            app.active
                .as_ref()
                .and_then(|name| app.binaries.get(name))
                .map(|stored| stored.image.clone())
        });
        Ok(image)
    }

    fn create_application(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.state
            .write()
            .applications
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    fn upload_binary(&self, application: &str, binary: &str, content: &[u8]) -> Result<String> {
        let file_name = binary_file_name(binary)?;
        self.image_check.validate(content)?;
        // Digest computed outside the lock
        let image = BinaryImage::new(file_name.clone(), Bytes::copy_from_slice(content));

        let mut state = self.state.write();
        let app = state
            .applications
            .get_mut(application)
            .ok_or_else(|| Error::UnknownApplication(application.to_string()))?;
        app.binaries.insert(
            file_name.clone(),
            StoredBinary {
                image,
                modified: Utc::now().trunc_subsecs(0),
            },
        );
        Ok(file_name)
    }

    fn set_active_binary(&self, application: &str, binary: &str) -> Result<()> {
        let file_name = binary_file_name(binary)?;

        let mut state = self.state.write();
        let app = state
            .applications
            .get_mut(application)
            .ok_or_else(|| Error::UnknownApplication(application.to_string()))?;
        if !app.binaries.contains_key(&file_name) {
            return Err(Error::UnknownBinary {
                application: application.to_string(),
                binary: file_name,
            });
        }
        app.active = Some(file_name);
        Ok(())
    }

    fn set_device_application(&self, device: &DeviceIdentity, application: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.applications.contains_key(application) {
            return Err(Error::UnknownApplication(application.to_string()));
        }
        state.devices.insert(*device, application.to_string());
        Ok(())
    }

    fn list_applications(&self) -> Result<Vec<ApplicationSummary>> {
        let state = self.state.read();
        let apps = state
            .applications
            .iter()
            .map(|(name, app)| ApplicationSummary {
                name: name.clone(),
                active: app.active.clone(),
                binaries: app
                    .binaries
                    .iter()
                    .map(|(name, stored)| BinarySummary {
                        name: name.clone(),
                        size: stored.image.content.len() as u64,
                        modified: Some(stored.modified),
                    })
                    .collect(),
            })
            .collect();
        Ok(apps)
    }

    fn image_check(&self) -> ImageCheck {
        self.image_check
    }

    fn list_devices(&self) -> Result<Vec<DeviceSummary>> {
        let state = self.state.read();
        let devices = state
            .devices
            .iter()
            .map(|(identity, application)| DeviceSummary {
                identity: *identity,
                application: Some(application.clone()),
            })
            .collect();
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

    fn device(text: &str) -> DeviceIdentity {
        DeviceIdentity::parse(text).unwrap()
    }

    #[test]
    fn test_full_chain() {
        let store = MemoryStore::new().with_image_check(ImageCheck::Disabled);
        let mac = device("18:FE:AA:AA:AA:AA");

        store.create_application("firmware-v1").unwrap();
        store.upload_binary("firmware-v1", "a.bin", b"foobar").unwrap();
        store.set_active_binary("firmware-v1", "a.bin").unwrap();
        store.set_device_application(&mac, "firmware-v1").unwrap();

        let app = store.resolve_application(&mac).unwrap().unwrap();
        let active = store.resolve_active_binary(&app).unwrap().unwrap();
        assert_eq!(&active.content[..], b"foobar");
        assert_eq!(active.digest, ContentDigest::of(b"foobar"));
    }

    #[test]
    fn test_default_requires_magic() {
        let store = MemoryStore::new();
        store.create_application("app").unwrap();
        assert!(matches!(
            store.upload_binary("app", "a", b"foobar"),
            Err(Error::InvalidImageFormat)
        ));

        let mut good = IMAGE_MAGIC.to_vec();
        good.extend_from_slice(b"foobar");
        assert_eq!(store.upload_binary("app", "a", &good).unwrap(), "a.bin");
    }

    #[test]
    fn test_unknown_targets() {
        let store = MemoryStore::new();
        let mac = device("18:FE:AA:AA:AA:AA");
        assert!(matches!(
            store.set_device_application(&mac, "ghost"),
            Err(Error::UnknownApplication(_))
        ));
        store.create_application("app").unwrap();
        assert!(matches!(
            store.set_active_binary("app", "ghost"),
            Err(Error::UnknownBinary { .. })
        ));
        assert!(store.resolve_active_binary("app").unwrap().is_none());
    }

    #[test]
    fn test_add_device_shortcut() {
        let store = MemoryStore::new().with_image_check(ImageCheck::Disabled);
        let mac = device("18:FE:AA:AA:AA:AA");
        store.add_device(&mac, Bytes::from_static(b"foobar")).unwrap();

        let app = store.resolve_application(&mac).unwrap().unwrap();
        assert_eq!(app, "device-18feaaaaaaaa");
        let active = store.resolve_active_binary(&app).unwrap().unwrap();
        assert_eq!(active.name, "sketch.bin");
        assert_eq!(store.list_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_swap_under_readers() {
        let store = Arc::new(MemoryStore::new().with_image_check(ImageCheck::Disabled));
        store.create_application("app").unwrap();
        store.upload_binary("app", "old", b"old image").unwrap();
        store.upload_binary("app", "new", b"new image").unwrap();
        store.set_active_binary("app", "old").unwrap();
        let allowed = [ContentDigest::of(b"old image"), ContentDigest::of(b"new image")];

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    store
                        .set_active_binary("app", if flip { "old" } else { "new" })
                        .unwrap();
                    flip = !flip;
                }
            })
        };

        for _ in 0..10_000 {
            let active = store.resolve_active_binary("app").unwrap().unwrap();
            assert!(allowed.contains(&active.digest));
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn test_device_reassign_under_readers() {
        let store = Arc::new(MemoryStore::new().with_image_check(ImageCheck::Disabled));
        for (app, content) in [("blue", &b"blue image"[..]), ("green", &b"green image"[..])] {
            store.create_application(app).unwrap();
            store.upload_binary(app, "fw", content).unwrap();
            store.set_active_binary(app, "fw").unwrap();
        }
        let allowed = [ContentDigest::of(b"blue image"), ContentDigest::of(b"green image")];
        let mac = device("18:FE:AA:AA:AA:AA");
        store.set_device_application(&mac, "blue").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    store
                        .set_device_application(&mac, if flip { "blue" } else { "green" })
                        .unwrap();
                    flip = !flip;
                }
            })
        };

        let resolver = ContentResolver::new(store.clone());
        for _ in 0..10_000 {
            match resolver.resolve(&mac).unwrap() {
                Resolution::Content(resolved) => assert!(allowed.contains(&resolved.digest)),
                other => panic!("device lost its application: {other:?}"),
            }
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
