use anyhow::Result;
use segbackup_core::{BackupEngine, Config};
use tracing::{info, warn};

use super::OutputFormat;

pub async fn run(config_path: &str, format: OutputFormat) -> Result<()> {
    info!("Loading configuration from: {}", config_path);

    let config_content = tokio::fs::read_to_string(config_path).await?;
    let config = Config::from_yaml(&config_content)?;

    info!("Starting backup: {}", config.backup_id);

    let engine = BackupEngine::new(config)?;
    let shutdown = engine.shutdown_handle();

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping backup");
            let _ = shutdown.send(());
        }
    });

    let result = engine.run().await;
    ctrl_c.abort();
    let report = result?;

    super::print_report(&report, format)?;
    info!("\n{}", engine.metrics().report());

    if !report.is_success() {
        anyhow::bail!("Backup finished with {} failed entries", report.failed());
    }

    info!("Backup completed successfully");
    Ok(())
}
