use anyhow::Result;
use segbackup_core::{Config, RestoreEngine};
use tracing::{info, warn};

use super::OutputFormat;

pub async fn run(config_path: &str, dry_run: bool, format: OutputFormat) -> Result<()> {
    info!("Loading configuration from: {}", config_path);

    let config_content = tokio::fs::read_to_string(config_path).await?;
    let mut config = Config::from_yaml(&config_content)?;

    if dry_run {
        config.restore.get_or_insert_with(Default::default).dry_run = true;
    }

    info!("Starting restore of backup: {}", config.backup_id);

    let engine = RestoreEngine::new(config)?;
    let shutdown = engine.shutdown_handle();

    // The checkpoint is saved when the executor observes the signal.
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight entries");
            let _ = shutdown.send(());
        }
    });

    let result = engine.run().await;
    ctrl_c.abort();
    let report = result?;

    super::print_report(&report, format)?;

    if !report.is_success() {
        anyhow::bail!("Restore finished with {} failed entries", report.failed());
    }

    if report.dry_run {
        info!("Dry run completed, target was not modified");
    } else {
        info!("Restore completed successfully");
    }
    Ok(())
}
