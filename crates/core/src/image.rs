//! Firmware image checks and name rules

use crate::error::{Error, Result};

/// Leading bytes of an ESP8266 application image
pub const IMAGE_MAGIC: [u8; 8] = [0xe9, 0x01, 0x02, 0x40, 0x9c, 0xf2, 0x10, 0x40];

/// Upper bound on application and binary names
pub const MAX_NAME_LEN: usize = 128;

/// Whether uploads must carry [`IMAGE_MAGIC`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageCheck {
    #[default]
    RequireMagic,
    Disabled,
}

impl ImageCheck {
    pub fn from_flag(verify_magic: bool) -> Self {
        if verify_magic {
            ImageCheck::RequireMagic
        } else {
            ImageCheck::Disabled
        }
    }

    pub fn validate(self, content: &[u8]) -> Result<()> {
        match self {
            ImageCheck::RequireMagic if !content.starts_with(&IMAGE_MAGIC) => {
                Err(Error::InvalidImageFormat)
            }
            _ => Ok(()),
        }
    }
}

/// Check that `name` is usable as a single path component
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.starts_with('.')
        || name.contains(&['/', '\\'][..])
        || name.chars().any(char::is_control);

    if invalid {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Validate a binary name and give it a `.bin` suffix if it lacks one
pub fn binary_file_name(name: &str) -> Result<String> {
    validate_name(name)?;
    if name.ends_with(".bin") {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.bin"))
    }
}
