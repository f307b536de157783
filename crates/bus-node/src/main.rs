//! # Bus Node
//!
//! Joins a message bus and relays stdin lines to every other member.
//!
//! ```text
//! bus-node [CONFIG.toml] [--name NAME] [--store PATH]
//! ```

use anyhow::{Context, Result};
use bus_node::{load_config, BusNode, NodeOptions};
use bus_telemetry::TelemetryConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    bus_telemetry::init_telemetry(&TelemetryConfig::for_service("bus-node"))
        .context("Failed to initialize telemetry")?;

    let options = NodeOptions::from_args(std::env::args().skip(1))?;
    let config = load_config(options.config_path.as_deref())?;

    let (node, inbox) = BusNode::new(config, &options)?;
    // A bus that cannot start leaves the node running with messaging disabled.
    if let Err(e) = node.start().await {
        error!("Message broker initialization error: {e:#}");
    }
    let logger = node.spawn_inbound_logger(inbox);
    let metrics = node.spawn_metrics(options.metrics_interval);

    if node.bus().is_ready() {
        info!("Node is running. Type a line to broadcast it, Ctrl+C to stop.");
    } else {
        warn!("Node is running without messaging; lines will not be sent");
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if !node.broadcast(line.trim()).await? {
                        warn!("Message was not sent");
                    }
                }
                None => {
                    info!("stdin closed");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    node.shutdown().await;
    let _ = tokio::join!(logger, metrics);
    if let Ok(text) = bus_telemetry::encode_metrics() {
        info!("Final metrics:\n{text}");
    }
    Ok(())
}
