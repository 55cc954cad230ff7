//! `espota app ...`

use crate::AppCommands;
use anyhow::{Context, Result};
use espota_cli::util::{format_relative_time, format_size};
use espota_cli::Config;
use espota_core::{AssignmentStore, FileSystemStore};
use owo_colors::OwoColorize;
use std::path::Path;

pub(crate) fn open_store(config: &Config) -> Result<FileSystemStore> {
    let root = &config.storage.root;
    let store = FileSystemStore::open(root)
        .with_context(|| format!("Failed to open data root {}", root.display()))?;
    Ok(store.with_image_check(config.image_check()))
}

pub async fn run(config: &Config, command: AppCommands) -> Result<()> {
    let store = open_store(config)?;

    match command {
        AppCommands::Create { name } => {
            store.create_application(&name)?;
            println!("{} {}", "Created application".green(), name.bold());
        }
        AppCommands::Upload {
            app,
            file,
            name,
            activate,
        } => {
            let binary = match name {
                Some(name) => name,
                None => default_binary_name(&file)?,
            };
            let content = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let stored = store
                .upload_binary(&app, &binary, &content)
                .with_context(|| format!("Failed to upload {}", file.display()))?;
            println!(
                "{} {}/{} {}",
                "Uploaded".green(),
                app.bold(),
                stored,
                format!("({})", format_size(content.len() as u64)).dimmed()
            );

            if activate {
                store.set_active_binary(&app, &stored)?;
                println!("{} {} -> {}", "Activated".green(), app.bold(), stored);
            }
        }
        AppCommands::Activate { app, binary } => {
            store.set_active_binary(&app, &binary)?;
            println!("{} {} -> {}", "Activated".green(), app.bold(), binary);
        }
        AppCommands::List => list(&store)?,
    }

    Ok(())
}

fn default_binary_name(file: &Path) -> Result<String> {
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("Cannot derive a binary name from {}", file.display()))?;
    Ok(name.to_string())
}

fn list(store: &FileSystemStore) -> Result<()> {
    let apps = store.list_applications()?;
    if apps.is_empty() {
        println!("{}", "No applications".dimmed());
        return Ok(());
    }

    for app in apps {
        let active = app.active.as_deref();
        println!(
            "{} {}",
            app.name.bold(),
            match active {
                Some(binary) => format!("(active: {})", binary).cyan().to_string(),
                None => "(no active binary)".yellow().to_string(),
            }
        );
        for binary in &app.binaries {
            let marker = if Some(binary.name.as_str()) == active { "*" } else { " " };
            let age = binary
                .modified
                .map(format_relative_time)
                .unwrap_or_default();
            println!(
                "  {} {:<32} {:>10}  {}",
                marker.green(),
                binary.name,
                format_size(binary.size),
                age.dimmed()
            );
        }
    }

    Ok(())
}
