//! Server configuration (`espota.toml`)
//!
//! Lookup order: `--config <path>`, `./espota.toml`, then
//! `<config dir>/espota/config.toml`. With none present the defaults apply.

use anyhow::{Context, Result};
use espota_core::{HeaderNames, ImageCheck};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const LOCAL_CONFIG_FILE: &str = "espota.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub protocol: ProtocolConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub listen: SocketAddr,
    /// Route devices check in on
    pub checkin_path: String,
    /// Mount the JSON admin API under `/admin`
    pub admin_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            checkin_path: "/get".to_string(),
            admin_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data root holding apps/, devices/ and tmp/
    pub root: PathBuf,
    /// Refuse uploads without the ESP image magic
    pub verify_image_magic: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            verify_image_magic: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Product name in the device headers, `X-<product>-STA-MAC`
    pub product: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            product: espota_core::checkin::DEFAULT_PRODUCT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter; `RUST_LOG` overrides it
    pub level: String,
    /// Also write to a daily rolling file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let product = &self.protocol.product;
        if product.is_empty() || !product.chars().all(|c| c.is_ascii_alphanumeric()) {
            anyhow::bail!(
                "protocol.product must be non-empty ASCII letters and digits, got {:?}",
                product
            );
        }

        let path = &self.server.checkin_path;
        if !path.starts_with('/') {
            anyhow::bail!("server.checkin_path must start with '/', got {:?}", path);
        }
        if self.server.admin_enabled && (path == "/admin" || path.starts_with("/admin/")) {
            anyhow::bail!("server.checkin_path {:?} collides with the admin API", path);
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "logging.level must be one of {}, got {:?}",
                LOG_LEVELS.join(", "),
                self.logging.level
            );
        }

        Ok(())
    }

    pub fn header_names(&self) -> HeaderNames {
        HeaderNames::new(&self.protocol.product)
    }

    pub fn image_check(&self) -> ImageCheck {
        ImageCheck::from_flag(self.storage.verify_image_magic)
    }
}

/// Per-user config file location
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("espota").join("config.toml"))
}

/// First config file that applies, if any
pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }

    config_file_path().filter(|path| path.is_file())
}

/// Load and validate a config file
pub fn load_from(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// Load the applicable config, returning where it came from
pub fn load(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    match locate(explicit) {
        Some(path) => Ok((load_from(&path)?, Some(path))),
        None => Ok((Config::default(), None)),
    }
}

/// Write the example config to the per-user location unless one exists
pub fn init_if_missing() -> Result<PathBuf> {
    let path = config_file_path().context("Could not determine config directory")?;
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(&path, example_config()).context("Failed to write config file")?;
    }
    Ok(path)
}

pub fn example_config() -> &'static str {
    r#"# espota configuration

[server]
# Address the HTTP listener binds to
listen = "0.0.0.0:8080"
# Route devices check in on (ESP8266httpUpdate URL path)
checkin_path = "/get"
# JSON admin API under /admin
admin_enabled = true

[storage]
# Data root: apps/, devices/, tmp/
root = "./data"
# Refuse uploads that do not start with the ESP image magic
verify_image_magic = true

[protocol]
# Header product name: X-<product>-STA-MAC, X-<product>-sketch-md5
product = "ESP8266"

[logging]
# trace, debug, info, warn or error (RUST_LOG overrides)
level = "info"
# file = "./logs/espota.log"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.checkin_path, "/get");
        assert_eq!(config.header_names().identity(), "X-ESP8266-STA-MAC");
        assert_eq!(config.image_check(), ImageCheck::RequireMagic);
    }

    #[test]
    fn test_example_parses_to_defaults() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str("[protocol]\nproduct = \"ESP32\"\n").unwrap();
        assert_eq!(config.protocol.product, "ESP32");
        assert_eq!(config.storage, StorageConfig::default());
        assert_eq!(config.header_names().digest(), "X-ESP32-sketch-md5");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.protocol.product = "ESP 8266".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.checkin_path = "get".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.checkin_path = "/admin/get".into();
        assert!(config.validate().is_err());
        config.server.admin_enabled = false;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("espota.toml");
        let text = "[storage]\nroot = \"/srv/ota\"\nverify_image_magic = false\n";
        std::fs::write(&path, text).unwrap();

        let (config, source) = load(Some(&path)).unwrap();
        assert_eq!(source.as_deref(), Some(path.as_path()));
        assert_eq!(config.storage.root, PathBuf::from("/srv/ota"));
        assert_eq!(config.image_check(), ImageCheck::Disabled);

        std::fs::write(&path, "[logging]\nlevel = \"chatty\"\n").unwrap();
        assert!(load_from(&path).is_err());
    }
}
