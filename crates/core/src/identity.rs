//! Canonical device identity (station MAC address)

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A device's 6-byte hardware address
///
/// Parsed from colon-hex form in either case; always rendered lowercase, and
/// that rendering is the storage key.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct DeviceIdentity([u8; 6]);

impl DeviceIdentity {
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse `xx:xx:xx:xx:xx:xx`
    ///
    /// Anything else is `MalformedIdentity`. There is no zero-address fallback.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = || Error::MalformedIdentity(text.to_string());

        let mut bytes = [0u8; 6];
        let mut parts = text.trim().split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(malformed)?;
            if part.len() != 2 {
                return Err(malformed());
            }
            let mut out = [0u8; 1];
            hex::decode_to_slice(part, &mut out).map_err(|_| malformed())?;
            *byte = out[0];
        }
        if parts.next().is_some() {
            return Err(malformed());
        }

        Ok(Self(bytes))
    }

    /// Storage key, e.g. `18:fe:aa:aa:aa:aa`
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl FromStr for DeviceIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceIdentity({})", self)
    }
}

impl Serialize for DeviceIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
