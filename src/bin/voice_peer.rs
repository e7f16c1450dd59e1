//! Voice Peer Application
//!
//! Runs one side of a LAN voice call: captures the microphone, sends it to
//! the peer, and plays whatever the peer sends back.
//!
//! ```text
//! voice-peer <peer_addr> [--listen PORT] [--config PATH] [--json]
//! voice-peer --list-devices
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_voice_call::{
    audio::device::{list_devices, CpalBackend},
    config::AppConfig,
    pipeline::VoicePipeline,
    protocol::TelemetrySnapshot,
};

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Args {
    peer: Option<String>,
    listen_port: Option<u16>,
    config_path: Option<PathBuf>,
    list_devices: bool,
    json: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--listen" => {
                let port = iter.next().context("--listen needs a port")?;
                args.listen_port = Some(port.parse().context("invalid listen port")?);
            }
            "--config" => {
                args.config_path = Some(iter.next().context("--config needs a path")?.into());
            }
            "--list-devices" => args.list_devices = true,
            "--json" => args.json = true,
            other if other.starts_with("--") => bail!("unknown option {}", other),
            other => {
                if args.peer.replace(other.to_string()).is_some() {
                    bail!("only one peer address may be given");
                }
            }
        }
    }
    Ok(args)
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn log_telemetry(telemetry: &TelemetrySnapshot, json: bool) {
    if json {
        match telemetry.to_json() {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize telemetry: {}", e),
        }
        return;
    }

    let send = &telemetry.send;
    let recv = &telemetry.receive;
    let sync = &telemetry.sync;
    tracing::info!(
        "Send: {} chunks, {} packets ({:.1}/s), {} queue drops | input {:.1} dB",
        send.chunks_sent,
        send.packets_sent,
        telemetry.send_rate(),
        send.chunks_dropped_queue,
        telemetry.audio.input_level_db
    );
    tracing::info!(
        "Receive: {} chunks, {} lost ({:.1}% loss), {} malformed, jitter {:.1} ms",
        recv.chunks_reassembled,
        recv.chunks_lost,
        recv.loss_rate() * 100.0,
        recv.malformed_packets,
        recv.jitter_ms
    );
    tracing::info!(
        "Playout: {:?}/{:?}, depth {}/{}, latency {:.1} ms, {} played, {} concealed, {} underruns",
        sync.state,
        sync.quality,
        sync.buffer_depth,
        sync.target_depth,
        sync.latency_ms,
        sync.played,
        sync.concealed,
        sync.underruns
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let mut config = match &args.config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default()?,
    };
    if let Some(port) = args.listen_port {
        config.network.listen_port = port;
    }
    let peer = match &args.peer {
        Some(peer) => Some(config.network.resolve_peer(peer)?),
        None => config.network.peer_address,
    };
    let Some(peer) = peer else {
        bail!("usage: voice-peer <peer_addr> [--listen PORT] [--config PATH] [--list-devices] [--json]");
    };

    tracing::info!("Starting voice peer, calling {}", peer);

    let mut pipeline = VoicePipeline::new(config, Arc::new(CpalBackend::new()));
    let listen = pipeline.start(Some(peer))?;
    tracing::info!("Listening on {}; press Ctrl+C to hang up", listen);

    let mut ticker = tokio::time::interval(TELEMETRY_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Hanging up");
                break;
            }
            _ = ticker.tick() => {
                log_telemetry(&pipeline.telemetry(), args.json);
                if let Some(e) = pipeline.check_errors() {
                    tracing::error!("Audio device failed: {}", e);
                    break;
                }
            }
        }
    }

    pipeline.stop();
    Ok(())
}
