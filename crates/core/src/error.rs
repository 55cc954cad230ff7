//! Error taxonomy shared by the store, resolver and check-in handler

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by espota-core
#[derive(Debug, Error)]
pub enum Error {
    /// Identity header absent or repeated
    #[error("One `{header}` header required")]
    MissingIdentity { header: String },

    /// Digest header absent, repeated or not 16 bytes of hex
    #[error("One `{header}` header with a 32 character hex MD5 required")]
    MissingDigest { header: String },

    /// Identity header present but not `xx:xx:xx:xx:xx:xx`
    #[error("Malformed hardware address: {0:?}")]
    MalformedIdentity(String),

    /// Application or binary name is not a single safe path component
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Unknown device")]
    UnknownDevice,

    #[error("No sketch available")]
    NoActiveBinary,

    #[error("Unknown application: {0}")]
    UnknownApplication(String),

    #[error("Unknown binary {binary} in application {application}")]
    UnknownBinary { application: String, binary: String },

    /// Uploaded image does not start with the firmware magic
    #[error("File has unexpected magic numbers")]
    InvalidImageFormat,

    /// I/O failure against the persisted state
    #[error("Storage failure during {operation} ({}): {source}", path.display())]
    Storage {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification used to map errors onto responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing request fields, always caller-caused
    Validation,
    /// Unknown device, unassigned device, no active binary
    NotFound,
    /// Administrative target does not exist
    Conflict,
    /// Persisted state could not be read or written
    Storage,
    /// Uploaded binary failed the magic check
    Format,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingIdentity { .. }
            | Error::MissingDigest { .. }
            | Error::MalformedIdentity(_)
            | Error::InvalidName(_) => ErrorKind::Validation,
            Error::UnknownDevice | Error::NoActiveBinary => ErrorKind::NotFound,
            Error::UnknownApplication(_) | Error::UnknownBinary { .. } => ErrorKind::Conflict,
            Error::Storage { .. } => ErrorKind::Storage,
            Error::InvalidImageFormat => ErrorKind::Format,
        }
    }

    pub fn storage(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::Storage {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Result type used throughout espota-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::MalformedIdentity("zz".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::NoActiveBinary.kind(), ErrorKind::NotFound);
        assert_eq!(Error::UnknownApplication("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::InvalidImageFormat.kind(), ErrorKind::Format);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::storage("read pointer", "/tmp/x", io);
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("read pointer"));
    }
}
