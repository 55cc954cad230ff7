//! Configuration command
//!
//! Prints the effective configuration and where it came from.

use anyhow::{Context, Result};
use espota_cli::config::{self, Config};
use owo_colors::OwoColorize;
use std::path::Path;

/// Print every configuration value
pub fn run_show(config: &Config, source: Option<&Path>) -> Result<()> {
    println!("{}", "Configuration".bold());
    match source {
        Some(path) => println!("{}: {}\n", "Location".dimmed(), path.display().dimmed()),
        None => println!("{}\n", "(built-in defaults)".dimmed()),
    }

    println!("{}", "[server]".yellow());
    println!("  {} = {}", "listen".cyan(), config.server.listen);
    println!("  {} = {}", "checkin_path".cyan(), config.server.checkin_path);
    println!("  {} = {}", "admin_enabled".cyan(), config.server.admin_enabled);

    println!("\n{}", "[storage]".yellow());
    println!("  {} = {}", "root".cyan(), config.storage.root.display());
    println!(
        "  {} = {}",
        "verify_image_magic".cyan(),
        config.storage.verify_image_magic
    );

    println!("\n{}", "[protocol]".yellow());
    let names = config.header_names();
    println!(
        "  {} = {} {}",
        "product".cyan(),
        config.protocol.product,
        format!("({}, {})", names.identity(), names.digest()).dimmed()
    );

    println!("\n{}", "[logging]".yellow());
    println!("  {} = {}", "level".cyan(), config.logging.level);
    match &config.logging.file {
        Some(file) => println!("  {} = {}", "file".cyan(), file.display()),
        None => println!("  {} = {}", "file".cyan(), "(stderr only)".dimmed()),
    }

    Ok(())
}

/// Print an example config file
pub fn run_example() -> Result<()> {
    print!("{}", config::example_config());
    Ok(())
}

/// Print the per-user config path, optionally creating the file
pub fn run_path(create: bool) -> Result<()> {
    let path = if create {
        config::init_if_missing()?
    } else {
        config::config_file_path().context("Could not determine config file path")?
    };
    println!("{}", path.display());
    Ok(())
}
