use anyhow::Result;
use segbackup_core::storage::FilesystemBackend;
use segbackup_core::{BackupManifest, Phase};
use tracing::info;

use super::{format_bytes, format_timestamp, OutputFormat};

pub async fn run(path: &str, backup_id: &str, format: OutputFormat) -> Result<()> {
    let storage = FilesystemBackend::new(path.into());

    info!("Loading backup manifest: {}", backup_id);
    let manifest = BackupManifest::load(&storage, backup_id).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", manifest.to_json()?);
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(&manifest)?);
        }
        OutputFormat::Text => {
            print_manifest_text(&manifest);
        }
    }

    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn print_manifest_text(manifest: &BackupManifest) {
    println!("╔══════════════════════════════════════════════════════════════════════╗");
    println!("║                         BACKUP MANIFEST                              ║");
    println!("╠══════════════════════════════════════════════════════════════════════╣");
    println!("║ Backup ID:      {:52} ║", manifest.backup_id);
    println!("║ Created:        {:52} ║", format_timestamp(manifest.created_at));
    let completed = manifest
        .completed_at
        .map(format_timestamp)
        .unwrap_or_else(|| "partial".to_string());
    println!("║ Completed:      {:52} ║", completed);
    if !manifest.source.is_empty() {
        println!("║ Source:         {:52} ║", manifest.source);
    }
    println!("║ Engine:         {:52} ║", manifest.source_version.to_string());
    println!(
        "║ Stat slots:     {:52} ║",
        manifest.statistics_features.slot_count
    );
    println!("║ Compression:    {:52} ║", format!("{:?}", manifest.compression).to_lowercase());
    if let Some(base) = &manifest.base_backup {
        println!("║ Base backup:    {:52} ║", base);
    }
    println!("║ Metadata only:  {:52} ║", yes_no(manifest.metadata_only));
    println!("║ Data only:      {:52} ║", yes_no(manifest.data_only));
    println!("║ Statistics:     {:52} ║", yes_no(manifest.with_stats));
    println!("╠══════════════════════════════════════════════════════════════════════╣");
    println!("║                              SUMMARY                                 ║");
    println!("╠══════════════════════════════════════════════════════════════════════╣");
    println!("║ TOC entries:    {:52} ║", manifest.toc.len());
    for phase in [Phase::PreData, Phase::Data, Phase::PostData, Phase::Statistics] {
        println!("║   {:13} {:52} ║", phase.to_string(), manifest.toc.count(phase));
    }
    println!("║ Total rows:     {:52} ║", manifest.total_rows());
    println!("║ Artifacts:      {:52} ║", manifest.artifacts.len());
    println!(
        "║ Artifact size:  {:52} ║",
        format_bytes(manifest.total_artifact_bytes())
    );
    if manifest.reused_chunks() > 0 {
        println!("║ Reused chunks:  {:52} ║", manifest.reused_chunks());
    }
    println!("╚══════════════════════════════════════════════════════════════════════╝");

    let data: Vec<_> = manifest.toc.phase(Phase::Data).collect();
    if !data.is_empty() {
        println!("\nRELATIONS");
        println!("{:<50} {:>12} {:>12}", "Name", "Rows", "Chunk");
        println!("{}", "─".repeat(76));
        for entry in data {
            let (rows, length) = entry
                .data
                .as_ref()
                .map(|d| (d.rows, d.length))
                .unwrap_or((0, 0));
            println!(
                "{:<50} {:>12} {:>12}",
                format!("{}.{}", entry.schema, entry.name),
                rows,
                format_bytes(length)
            );
        }
    }
}
