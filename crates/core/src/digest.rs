//! MD5 content digests identifying firmware images
//!
//! MD5 is what the ESP8266/ESP32 update clients send and verify, so it is
//! kept for wire compatibility rather than as a security measure.

use crate::error::{Error, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// A 16-byte MD5 digest over a binary's exact bytes
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ContentDigest([u8; 16]);

impl ContentDigest {
    pub const LEN: usize = 16;

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Digest of `data`
    pub fn of(data: &[u8]) -> Self {
        let hash = Md5::digest(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex, the form devices send and expect back
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse 32 hex characters in either case
    ///
    /// The error carries the header name so the device gets a useful reason.
    pub fn from_hex(text: &str, header: &str) -> Result<Self> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(text.trim(), &mut bytes).map_err(|_| Error::MissingDigest {
            header: header.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
