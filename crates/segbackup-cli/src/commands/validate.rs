use anyhow::Result;
use segbackup_core::artifact::read_chunk;
use segbackup_core::storage::{metadata_key, statistics_key, FilesystemBackend, StorageBackend};
use segbackup_core::toc::metadata_statement;
use segbackup_core::{BackupManifest, Phase, StatisticsFile};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use super::format_timestamp;

#[derive(Debug, Default)]
struct ValidationReport {
    entries_checked: usize,
    artifacts_checked: usize,
    artifacts_missing: usize,
    chunks_checked: usize,
    chunks_corrupted: usize,
    rows_validated: u64,
    issues: Vec<String>,
}

impl ValidationReport {
    fn is_valid(&self) -> bool {
        self.artifacts_missing == 0 && self.chunks_corrupted == 0 && self.issues.is_empty()
    }

    fn print(&self) {
        println!("\n=== Validation Report ===\n");
        println!("Entries Checked:    {}", self.entries_checked);
        println!("Artifacts Checked:  {}", self.artifacts_checked);
        println!("Artifacts Missing:  {}", self.artifacts_missing);
        println!("Chunks Checked:     {}", self.chunks_checked);
        println!("Chunks Corrupted:   {}", self.chunks_corrupted);
        println!("Rows Validated:     {}", self.rows_validated);

        if !self.issues.is_empty() {
            println!("\nIssues Found:");
            for issue in &self.issues {
                println!("  - {}", issue);
            }
        }

        println!();
        if self.is_valid() {
            println!("Result: VALID");
        } else {
            println!("Result: INVALID");
        }
    }
}

pub async fn run(path: &str, backup_id: &str, deep: bool) -> Result<()> {
    info!("Validating backup: {} (deep={})", backup_id, deep);

    let storage = FilesystemBackend::new(PathBuf::from(path));
    let mut report = ValidationReport::default();

    let manifest = match BackupManifest::load(&storage, backup_id).await {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to load manifest: {}", e);
            report.issues.push(format!("Manifest unusable: {}", e));
            report.print();
            std::process::exit(1);
        }
    };

    println!("Validating backup: {}", manifest.backup_id);
    println!("Created: {}", format_timestamp(manifest.created_at));
    if !manifest.is_complete() {
        report
            .issues
            .push("Backup never completed; restoring it may produce a partial database".to_string());
    }

    check_metadata(&storage, &manifest, &mut report).await;
    if manifest.with_stats {
        check_statistics(&storage, &manifest, &mut report).await;
    }
    check_artifacts(&storage, &manifest, &mut report).await;
    if deep {
        check_chunks(&storage, &manifest, &mut report).await;
    }

    report.print();

    if !report.is_valid() {
        std::process::exit(1);
    }

    Ok(())
}

/// Every DDL-bearing entry must resolve to a statement in `metadata.sql`.
async fn check_metadata(storage: &FilesystemBackend, manifest: &BackupManifest, report: &mut ValidationReport) {
    let metadata = match storage.get(&metadata_key(&manifest.backup_id)).await {
        Ok(data) => data,
        Err(e) => {
            if !manifest.data_only {
                report.issues.push(format!("metadata.sql unreadable: {}", e));
            }
            return;
        }
    };

    for entry in manifest.toc.iter().filter(|e| e.metadata.is_some()) {
        report.entries_checked += 1;
        if let Err(e) = metadata_statement(&metadata, entry) {
            report.issues.push(format!("{}: {}", entry.label(), e));
        }
    }
}

async fn check_statistics(storage: &FilesystemBackend, manifest: &BackupManifest, report: &mut ValidationReport) {
    let key = statistics_key(&manifest.backup_id);
    let data = match storage.get(&key).await {
        Ok(data) => data,
        Err(e) => {
            report.issues.push(format!("statistics.json unreadable: {}", e));
            return;
        }
    };
    match serde_json::from_slice::<StatisticsFile>(&data) {
        Ok(file) => {
            let in_toc: HashSet<_> = manifest.toc.phase(Phase::Statistics).map(|e| e.oid).collect();
            for oid in file.relations() {
                if !in_toc.contains(&oid) {
                    warn!("Statistics recorded for relation {} with no TOC entry", oid);
                }
            }
        }
        Err(e) => report.issues.push(format!("statistics.json parse error: {}", e)),
    }
}

/// Artifacts listed in the manifest must exist with the recorded size.
async fn check_artifacts(storage: &FilesystemBackend, manifest: &BackupManifest, report: &mut ValidationReport) {
    for artifact in &manifest.artifacts {
        report.artifacts_checked += 1;
        match storage.size(&artifact.key).await {
            Ok(size) if size == artifact.size => {
                debug!("Artifact {} OK ({} bytes)", artifact.key, size);
            }
            Ok(size) => {
                report.chunks_corrupted += 1;
                report.issues.push(format!(
                    "Size mismatch for {}: expected {}, found {}",
                    artifact.key, artifact.size, size
                ));
            }
            Err(_) => {
                report.artifacts_missing += 1;
                report.issues.push(format!("Missing artifact: {}", artifact.key));
            }
        }
    }

    // Chunks reused from a base backup point at another backup's artifacts.
    let own: HashSet<&str> = manifest.artifacts.iter().map(|a| a.key.as_str()).collect();
    let mut foreign: Vec<&str> = manifest
        .toc
        .phase(Phase::Data)
        .filter_map(|e| e.data.as_ref())
        .map(|d| d.artifact.as_str())
        .filter(|key| !own.contains(key))
        .collect();
    foreign.sort_unstable();
    foreign.dedup();
    for key in foreign {
        report.artifacts_checked += 1;
        if !matches!(storage.exists(key).await, Ok(true)) {
            report.artifacts_missing += 1;
            report.issues.push(format!("Missing base artifact: {}", key));
        }
    }
}

/// Decompress every chunk and compare its line count with the TOC.
async fn check_chunks(storage: &FilesystemBackend, manifest: &BackupManifest, report: &mut ValidationReport) {
    for entry in manifest.toc.phase(Phase::Data) {
        let Some(range) = &entry.data else {
            continue;
        };
        report.chunks_checked += 1;
        match read_chunk(storage, range).await {
            Ok(rows) => {
                let count = rows.iter().filter(|b| **b == b'\n').count() as u64;
                if count == range.rows {
                    report.rows_validated += count;
                } else {
                    report.chunks_corrupted += 1;
                    report.issues.push(format!(
                        "{}: expected {} rows, chunk holds {}",
                        entry.label(),
                        range.rows,
                        count
                    ));
                }
            }
            Err(e) => {
                report.chunks_corrupted += 1;
                report.issues.push(format!("{}: {}", entry.label(), e));
            }
        }
    }
}
