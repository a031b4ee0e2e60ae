//! usbd - run a file-backed relay device and drive it from the command line
//!
//! The agent serves requests from a backing file on one blocking task while
//! the requested front-end operation runs on another.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use uuid::Uuid;

use usbd::telemetry::{init_tracing, shutdown_tracing};
use usbd::{span_with_trace, AgentRunner, Device, DeviceConfig, DeviceError, FileBackend};

#[derive(Parser)]
#[command(name = "usbd", version, about = "User-space block device relay")]
struct Cli {
    /// JSON device configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// File the agent stores the device contents in
    #[arg(long, global = true, default_value = "usbd.img")]
    backing: PathBuf,

    /// Override the configured size, in 512-byte sectors
    #[arg(long, global = true)]
    sectors: Option<u64>,

    /// Export spans to this OTLP collector
    #[arg(long, global = true)]
    otlp_endpoint: Option<String>,

    /// Dump Prometheus metrics before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a file's contents starting at a block
    Write {
        #[arg(long)]
        block: u64,
        #[arg(long)]
        input: PathBuf,
    },
    /// Read bytes starting at a block
    Read {
        #[arg(long)]
        block: u64,
        #[arg(long)]
        length: usize,
        /// Destination file (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Write a pattern, read it back and compare
    Selftest {
        #[arg(long, default_value_t = 10_000)]
        bytes: usize,
        #[arg(long, default_value_t = 10)]
        block: u64,
    },
}

fn device_failure(e: DeviceError) -> anyhow::Error {
    anyhow!("{} (errno {:?})", e, e.errno())
}

fn run_command(device: &Arc<Device>, command: Command) -> anyhow::Result<()> {
    let trace_id = Uuid::now_v7();
    let span = span_with_trace!(Level::INFO, "front_end", trace_id);
    let _entered = span.enter();

    let front_end = device.open_front_end().map_err(device_failure)?;

    match command {
        Command::Write { block, input } => {
            let data = std::fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let written = front_end.write_at(block, &data).map_err(device_failure)?;
            println!("wrote {} bytes at block {}", written, block);
        }
        Command::Read {
            block,
            length,
            output,
        } => {
            let mut data = vec![0u8; length];
            let read = front_end.read_at(block, &mut data).map_err(device_failure)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &data[..read])
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("read {} bytes from block {} into {}", read, block, path.display());
                }
                None => std::io::stdout().write_all(&data[..read])?,
            }
        }
        Command::Selftest { bytes, block } => {
            let pattern: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
            front_end.write_at(block, &pattern).map_err(device_failure)?;

            let mut readback = vec![0u8; bytes];
            front_end.read_at(block, &mut readback).map_err(device_failure)?;

            if let Some(offset) = pattern.iter().zip(&readback).position(|(a, b)| a != b) {
                bail!("selftest mismatch at byte {}", offset);
            }
            println!(
                "selftest ok: {} bytes at block {} in {} chunks",
                bytes,
                block,
                device.chunk_count(bytes)
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("usbd", cli.otlp_endpoint.as_deref()).map_err(|e| anyhow!(e))?;

    let mut config = match &cli.config {
        Some(path) => DeviceConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DeviceConfig::default(),
    };
    if let Some(sectors) = cli.sectors {
        config.sectors = sectors;
    }

    let device = Device::new(config)?;
    let backend = FileBackend::open(&cli.backing, device.size_bytes())
        .with_context(|| format!("failed to open backing file {}", cli.backing.display()))?;
    info!(
        device_id = %device.id(),
        backing = %cli.backing.display(),
        size_bytes = device.size_bytes(),
        "Starting agent"
    );

    let mut session = device.open_agent()?;
    let mut runner = AgentRunner::new(backend);
    let stop = runner.stop_handle(&device);
    let agent = tokio::task::spawn_blocking(move || runner.run(&mut session));

    let front_end = {
        let device = Arc::clone(&device);
        let command = cli.command;
        tokio::task::spawn_blocking(move || run_command(&device, command))
    };

    let outcome = tokio::select! {
        joined = front_end => joined.context("front-end task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received, shutting down");
            Err(anyhow!("interrupted"))
        }
    };

    stop.stop();
    device.shutdown();
    let stats = agent.await.context("agent task panicked")??;
    info!(stats = ?stats, "Agent stopped");

    if cli.print_metrics {
        print!("{}", usbd::metrics::gather_text());
    }
    if cli.otlp_endpoint.is_some() {
        shutdown_tracing();
    }
    outcome
}
