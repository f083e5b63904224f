use crabship::config::LoggingConfig;
use crabship::{Config, NetWriter, ShipperHandle};
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().await.map_err(|e| anyhow::anyhow!(e))?;
    init_logging(&config.logging);

    info!("Starting CrabShip v{}", crabship::VERSION);

    let writer_config = config.net_writer_config()?;
    info!(
        address = %writer_config.address,
        soft_start = writer_config.soft_start,
        "Configuration loaded"
    );

    let writer = NetWriter::open(writer_config, Path::new(&config.data_dir)).await?;
    let mut handle = writer.handle();

    // Ship stdin line by line until EOF or shutdown signal.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = pump_stdin(&mut handle) => {
            info!("Input exhausted");
        }
    }

    info!("Shutting down CrabShip...");
    writer.close().await?;
    info!("Shutdown complete");

    Ok(())
}

/// Read stdin lines and store each as one record, terminator included.
async fn pump_stdin(handle: &mut ShipperHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut record = Vec::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                record.clear();
                record.extend_from_slice(line.as_bytes());
                record.push(b'\n');
                if let Err(e) = handle.write_all(&record) {
                    error!(error = %e, "failed to store record");
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to read input");
                return;
            }
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.format == "json" {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
