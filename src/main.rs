use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use config::Config;
use port::discover;
use scheduler::Scheduler;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use sink::CsvSink;
use tokio::sync::oneshot;

mod aggregator;
mod config;
mod device;
mod line;
mod port;
mod reading;
mod scheduler;
mod sink;
#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env().context("Failed to load configuration")?;

    TermLogger::init(
        config.log_level,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")?;

    if let Err(e) = run(config).await {
        log::error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}

pub async fn run(config: Config) -> Result<(), anyhow::Error> {
    let shutdown = shutdown_signal();

    log::info!("Searching for devices with vendor id {:#06x}...", config.vendor_id);
    let candidates = discover(config.vendor_id).context("Failed to list serial ports")?;
    if candidates.is_empty() {
        return Err(anyhow::anyhow!(
            "No devices with vendor id {:#06x} found",
            config.vendor_id
        ));
    }
    log::info!("Found {}: {}", candidates.len(), candidates.join(", "));

    let path = sink::file_path(&config.output.dir, &config.output.file_prefix, Local::now());
    let sink = CsvSink::create(&path)?;
    log::info!("Logging to {}", path.display());

    let scheduler = Scheduler::new(
        config.acquisition,
        Arc::new(config.serial),
        config.labels,
        sink,
    );

    let summary = scheduler
        .run(candidates, async {
            let _ = shutdown.await;
        })
        .await
        .context("Acquisition failed")?;

    log::info!(
        "Closed {} devices after {} ticks, {} rows written to {}",
        summary.devices.len(),
        summary.ticks,
        summary.rows_written,
        path.display()
    );

    Ok(())
}

/// Starts listening for Ctrl+C right away, so an interrupt during device
/// identification still ends the run through the normal close path.
fn shutdown_signal() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Data logging interrupted."),
            Err(e) => log::error!("Failed to wait for Ctrl+C signal, stopping: {e}"),
        }
        let _ = tx.send(());
    });
    rx
}
