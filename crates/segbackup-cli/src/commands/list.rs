use anyhow::Result;
use segbackup_core::storage::{FilesystemBackend, StorageBackend};
use segbackup_core::{BackupManifest, Phase};
use tracing::{info, warn};

use super::format_timestamp;

pub async fn run(path: &str, backup_id: Option<&str>) -> Result<()> {
    let storage = FilesystemBackend::new(path.into());

    match backup_id {
        Some(id) => {
            // Show details for a specific backup
            info!("Loading backup manifest: {}", id);
            let manifest = BackupManifest::load(&storage, id).await?;

            println!("Backup ID: {}", manifest.backup_id);
            println!("Created: {}", format_timestamp(manifest.created_at));
            match manifest.completed_at {
                Some(ts) => println!("Completed: {}", format_timestamp(ts)),
                None => println!("Completed: no (partial backup)"),
            }
            println!("Source: {}", manifest.source_version);
            if let Some(base) = &manifest.base_backup {
                println!("Base backup: {}", base);
            }

            println!("\nRelations:");
            for entry in manifest.toc.phase(Phase::Data) {
                let rows = entry.data.as_ref().map(|d| d.rows).unwrap_or(0);
                println!("  - {}.{} ({} rows)", entry.schema, entry.name, rows);
            }
        }
        None => {
            // List all backups
            info!("Listing backups in: {}", path);
            let entries = storage.list("").await?;

            let backup_ids: Vec<_> = entries
                .iter()
                .filter(|e| e.ends_with("/manifest.json"))
                .map(|e| e.trim_end_matches("/manifest.json"))
                .collect();

            if backup_ids.is_empty() {
                println!("No backups found in {}", path);
                return Ok(());
            }

            println!("Available backups:");
            for id in backup_ids {
                match BackupManifest::load(&storage, id).await {
                    Ok(manifest) => {
                        let state = if manifest.is_complete() { "complete" } else { "partial" };
                        println!(
                            "  - {} ({}, {}, {} entries)",
                            id,
                            format_timestamp(manifest.created_at),
                            state,
                            manifest.toc.len()
                        );
                    }
                    Err(e) => {
                        warn!("Unreadable manifest for {}: {}", id, e);
                        println!("  - {} (unreadable manifest)", id);
                    }
                }
            }
        }
    }

    Ok(())
}
