//! `espota device ...`

use super::app::open_store;
use crate::DeviceCommands;
use anyhow::{Context, Result};
use espota_cli::util::format_relative_time;
use espota_cli::Config;
use espota_core::{AssignmentStore, AuditSink, Decision, DeviceIdentity, MetaValue};
use espota_journal::FileJournal;
use owo_colors::OwoColorize;

pub async fn run(config: &Config, command: DeviceCommands) -> Result<()> {
    let store = open_store(config)?;

    match command {
        DeviceCommands::Assign { mac, app } => {
            let device = DeviceIdentity::parse(&mac)?;
            store.set_device_application(&device, &app)?;
            println!("{} {} -> {}", "Assigned".green(), device.bold(), app);
        }
        DeviceCommands::List => {
            let journal = FileJournal::open(store.root()).context("Failed to open journal")?;
            let devices = store.list_devices()?;
            if devices.is_empty() {
                println!("{}", "No devices".dimmed());
            }
            for device in devices {
                let seen = journal
                    .device_info(&device.identity)?
                    .and_then(|info| match info.get("last_seen") {
                        Some(MetaValue::Timestamp(at)) => Some(format_relative_time(*at)),
                        _ => None,
                    })
                    .unwrap_or_else(|| "never seen".to_string());
                println!(
                    "{}  {:<24} {}",
                    device.identity.bold(),
                    device.application.as_deref().unwrap_or("-"),
                    seen.dimmed()
                );
            }
        }
        DeviceCommands::Show { mac, limit } => {
            let device = DeviceIdentity::parse(&mac)?;
            let journal = FileJournal::open(store.root()).context("Failed to open journal")?;

            println!("{}", device.bold());
            println!(
                "  {}: {}",
                "application".cyan(),
                store
                    .resolve_application(&device)?
                    .unwrap_or_else(|| "-".to_string())
            );

            match journal.device_info(&device)? {
                Some(info) => {
                    println!("\n{}", "Info".bold());
                    for (key, value) in info {
                        let text = match value {
                            MetaValue::Integer(n) => n.to_string(),
                            MetaValue::Timestamp(at) => {
                                format!("{} ({})", at.to_rfc3339(), format_relative_time(at))
                            }
                            MetaValue::Text(text) => text,
                        };
                        println!("  {}: {}", key.cyan(), text);
                    }
                }
                None => println!("  {}", "No check-ins recorded".dimmed()),
            }

            let requests = journal.requests(&device, limit)?;
            if !requests.is_empty() {
                println!("\n{}", "Recent check-ins".bold());
            }
            for event in requests {
                let status = match event.decision {
                    Decision::NotModified => event.status.to_string().dimmed().to_string(),
                    Decision::Update => event.status.to_string().green().to_string(),
                    Decision::Rejected => event.status.to_string().yellow().to_string(),
                    Decision::Failed | Decision::Interrupted => {
                        event.status.to_string().red().to_string()
                    }
                };
                let detail = event.binary.or(event.reason).unwrap_or_default();
                println!(
                    "  {}  {}  {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    status,
                    detail
                );
            }
        }
    }

    Ok(())
}
