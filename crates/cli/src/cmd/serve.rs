//! `espota serve`

use anyhow::{Context, Result};
use bytes::Bytes;
use espota_cli::locks::ServerLock;
use espota_cli::server::{self, AppState};
use espota_cli::util::outbound_ip;
use espota_cli::Config;
use espota_core::{
    AssignmentStore, AuditSink, DeviceIdentity, FileSystemStore, MemoryAudit, MemoryStore,
    NullAudit,
};
use espota_journal::FileJournal;
use owo_colors::OwoColorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(
    config: &Config,
    listen: Option<SocketAddr>,
    memory: bool,
    audit: bool,
    devices: &[String],
) -> Result<()> {
    let listen = listen.unwrap_or(config.server.listen);
    if !audit {
        info!("Check-in auditing disabled");
    }

    // The lock is held until the server stops
    let (store, audit, _lock) = if memory {
        let store = MemoryStore::new().with_image_check(config.image_check());
        for seed in devices {
            let (device, path) = parse_seed(seed)?;
            let content = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            store
                .add_device(&device, Bytes::from(content))
                .with_context(|| format!("Failed to seed {}", device))?;
            info!("Seeded {} with {}", device, path.display());
        }
        let store: Arc<dyn AssignmentStore> = Arc::new(store);
        let audit: Arc<dyn AuditSink> = if audit {
            Arc::new(MemoryAudit::new())
        } else {
            Arc::new(NullAudit)
        };
        (store, audit, None)
    } else {
        let root = &config.storage.root;
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create data root {}", root.display()))?;
        let lock = ServerLock::acquire(root, Some(listen))?;

        let store = FileSystemStore::open(root)
            .context("Failed to open store")?
            .with_image_check(config.image_check());
        let audit: Arc<dyn AuditSink> = if audit {
            Arc::new(FileJournal::open(store.root()).context("Failed to open journal")?)
        } else {
            Arc::new(NullAudit)
        };
        info!("Serving from {}", store.root().display());
        let store: Arc<dyn AssignmentStore> = Arc::new(store);
        (store, audit, Some(lock))
    };

    let state = AppState::new(store, audit, config.header_names());

    let host = match outbound_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            warn!("Could not determine outbound address: {}", e);
            listen.ip().to_string()
        }
    };
    println!(
        "{} on {}:{}{}",
        "Starting server".green().bold(),
        host,
        listen.port(),
        config.server.checkin_path
    );
    if config.server.admin_enabled {
        println!("  {} http://{}:{}/admin", "admin".dimmed(), host, listen.port());
    }

    server::serve(state, &config.server, listen).await
}

/// `MAC=FILE`
fn parse_seed(seed: &str) -> Result<(DeviceIdentity, PathBuf)> {
    let (mac, file) = seed
        .split_once('=')
        .with_context(|| format!("Expected MAC=FILE, got {:?}", seed))?;
    let device = DeviceIdentity::parse(mac)?;
    if file.is_empty() {
        anyhow::bail!("Missing file in {:?}", seed);
    }
    Ok((device, PathBuf::from(file)))
}
