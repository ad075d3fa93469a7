//! fieldlinkd - fieldlink polling daemon
//!
//! Builds the configured channels and devices, polls every device on a fixed
//! interval and logs the decoded values.
//!
//! Usage:
//!   fieldlinkd [config.toml]
//!
//! If no config file is provided, a mock channel is used for demo purposes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fieldlink::config::PointConfig;
use fieldlink::{Channel, Device, FieldlinkConfig, OutboundMessage, SignedProtocol};
use fieldlink_core::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Demo setup: one mock channel echoing requests back as responses
const DEMO_CONFIG: &str = r#"
[poll]
interval_ms = 1000

[[channels]]
name = "demo"
transport = { type = "mock", latency_ms = 20 }

[[channels.devices]]
name = "meter-1"
request = "0bb80001"

[[channels.devices.points]]
name = "voltage"
address = "0"
data_type = "uint16"

[[channels.devices.points]]
name = "breaker_closed"
address = "3.0"
data_type = "bool"

[[channels.devices]]
name = "meter-2"
request = "00fa0000"

[[channels.devices.points]]
name = "current"
address = "0"
data_type = "uint16"
"#;

/// Parsed command-line arguments
struct Args {
    /// Config file (TOML)
    config_path: Option<String>,
}

fn parse_args() -> Args {
    let mut result = Args { config_path: None };

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                // Positional argument = config file
                result.config_path = Some(arg.to_string());
            }
            _ => {
                tracing::warn!("Unknown argument: {}", arg);
            }
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"fieldlinkd - fieldlink polling daemon

Usage: fieldlinkd [config.toml]

Options:
  -h, --help    Print this help message

Examples:
  # Run against the built-in mock channel
  fieldlinkd

  # Run with config file
  fieldlinkd fieldlink.toml

Log filtering follows RUST_LOG (default: fieldlinkd=info,fieldlink=info).
"#
    );
}

/// A device and what to ask it on each poll
struct PollTarget {
    device: Arc<Device>,
    request: Option<Vec<u8>>,
    points: Vec<PointConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldlinkd=info,fieldlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fieldlinkd");

    let args = parse_args();
    let config = match args.config_path {
        Some(ref path) => {
            tracing::info!("Loading config from: {}", path);
            FieldlinkConfig::load(path).with_context(|| format!("loading {}", path))?
        }
        None => {
            tracing::info!("No config file provided, using mock transport");
            FieldlinkConfig::from_toml_str(DEMO_CONFIG)?
        }
    };

    let (channels, targets) = build(&config)?;
    tracing::info!(
        channels = channels.len(),
        devices = targets.len(),
        interval_ms = config.poll.interval_ms,
        "Polling started"
    );

    let shutdown = CancellationToken::new();
    let interval = Duration::from_millis(config.poll.interval_ms);
    let mut pollers = Vec::new();
    let mut devices = Vec::new();
    for target in targets {
        devices.push(target.device.clone());
        pollers.push(tokio::spawn(poll_loop(target, interval, shutdown.clone())));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    shutdown.cancel();

    for poller in pollers {
        if let Err(e) = poller.await {
            tracing::warn!("Poller task failed: {}", e);
        }
    }
    for device in devices {
        device.dispose().await;
    }
    for channel in &channels {
        tracing::debug!(channel = channel.name(), state = %channel.state(), "Channel released");
    }

    Ok(())
}

/// Create channels and attach their devices
fn build(config: &FieldlinkConfig) -> anyhow::Result<(Vec<Arc<Channel>>, Vec<PollTarget>)> {
    let mut channels = Vec::new();
    let mut targets = Vec::new();

    for channel_config in &config.channels {
        let channel = Channel::from_config(channel_config)
            .with_context(|| format!("channel '{}'", channel_config.name))?;

        for device_config in &channel_config.devices {
            let protocol = SignedProtocol::new("signed").with_multi_device(device_config.multi_device);
            let device = Device::new(
                device_config.name.clone(),
                Arc::new(protocol),
                device_config.options(),
            );
            device
                .attach(&channel, None)
                .with_context(|| format!("attaching device '{}'", device_config.name))?;

            targets.push(PollTarget {
                device,
                request: device_config.request_bytes()?,
                points: device_config.points.clone(),
            });
        }
        tracing::info!(
            channel = %channel_config.name,
            transport = %channel.transport().describe(),
            devices = channel.member_count(),
            "Channel configured"
        );
        channels.push(channel);
    }

    Ok((channels, targets))
}

async fn poll_loop(target: PollTarget, interval: Duration, shutdown: CancellationToken) {
    let name = target.device.name().to_string();
    let Some(request) = target.request.clone() else {
        tracing::info!(device = %name, "No poll request configured, device idle");
        return;
    };
    let message = OutboundMessage::new(request);
    let mut last: HashMap<String, Value> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match target.device.send_then_return(&message, &shutdown).await {
            Ok(reply) => {
                tracing::debug!(device = %name, payload = %hex::encode(&reply.payload), "Poll reply");
                publish(&target, &reply.payload, &mut last);
            }
            Err(e) if shutdown.is_cancelled() => {
                tracing::debug!(device = %name, error = %e, "Poll interrupted by shutdown");
                break;
            }
            Err(e) => {
                tracing::warn!(device = %name, error = %e, "Poll failed");
            }
        }
    }

    let stats = target.device.stats();
    tracing::info!(
        device = %name,
        requests = stats.requests,
        successes = stats.successes,
        timeouts = stats.timeouts,
        failures = stats.failures,
        "Poller stopped"
    );
}

/// Decode configured points and log the ones that changed
fn publish(target: &PollTarget, payload: &[u8], last: &mut HashMap<String, Value>) {
    for point in &target.points {
        let converted = target.device.decode_value(
            payload,
            &point.address,
            point.data_type,
            point.array_len,
            last.get(&point.name),
        );
        match converted {
            Ok(converted) if converted.changed => {
                tracing::info!(
                    device = target.device.name(),
                    point = %point.name,
                    value = ?converted.value,
                    "Value changed"
                );
                last.insert(point.name.clone(), converted.value);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    device = target.device.name(),
                    point = %point.name,
                    error = %e,
                    "Failed to decode point"
                );
            }
        }
    }
}
