//! RDA monitor
//!
//! Connects to an RDA server and prints a line per received block with the
//! mean of every channel, plus any markers.
//!
//! Usage:
//!   cargo run --example rda_monitor -- --address 127.0.0.1:51244 --reconnect

use biocorder::rda::{RdaClient, RdaClientSettings};
use biocorder::{Module, Output, Pipeline, RecordingMode, StageResult, StreamBlock};
use clap::Parser;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "RDA stream monitor")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:51244")]
    address: String,

    /// Reconnect after the connection was lost
    #[arg(short, long)]
    reconnect: bool,

    /// Stop after this many blocks (0 = run until interrupted)
    #[arg(short, long, default_value_t = 0)]
    blocks: u64,

    /// Channels shown per line
    #[arg(long, default_value_t = 8)]
    channels: usize,
}

struct BlockPrinter {
    shown: usize,
    printed: u64,
}

impl Module for BlockPrinter {
    fn name(&self) -> &str {
        "Printer"
    }

    fn on_input(&mut self, block: StreamBlock) -> StageResult {
        self.printed += 1;
        if block.mode == RecordingMode::Impedance {
            let values: Vec<String> = block
                .channels
                .iter()
                .enumerate()
                .take(self.shown)
                .map(|(i, c)| format!("{}={:.0}k", c.name, block.data.get(i, 0) / 1000.0))
                .collect();
            info!("[Printer] Impedance {}", values.join(" "));
            return Ok(());
        }

        let means: Vec<String> = (0..block.data.rows().min(self.shown))
            .map(|row| {
                let values = block.data.row(row);
                let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
                format!("{}={:.1}", block.channels[row].name, mean)
            })
            .collect();
        info!(
            "[Printer] #{} @{} {} samples {}",
            self.printed,
            block.counter.first().copied().unwrap_or(0),
            block.samples(),
            means.join(" ")
        );
        for marker in &block.markers {
            info!("[Printer]   {} '{}' at {}", marker.kind, marker.description, marker.position);
        }
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::NoData)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("=== RDA Monitor ===");
    info!("Server: {}", args.address);

    let mut pipeline = Pipeline::new();
    let client = RdaClient::new(RdaClientSettings {
        address: args.address.clone(),
        auto_reconnect: args.reconnect,
        connect: true,
    })?;
    pipeline.add_stage("RDA Client", client)?;
    pipeline.add_stage(
        "Printer",
        BlockPrinter {
            shown: args.channels,
            printed: 0,
        },
    )?;
    pipeline.connect("RDA Client", "Printer")?;

    // the client starts itself when the server announces a recording
    let started = Instant::now();
    loop {
        thread::sleep(Duration::from_millis(200));
        let received = pipeline
            .stats()
            .into_iter()
            .find(|(name, _)| name == "RDA Client")
            .map(|(_, stats)| stats.blocks)
            .unwrap_or(0);
        if args.blocks > 0 && received >= args.blocks {
            info!("Received {} blocks in {:?}", received, started.elapsed());
            break;
        }
    }

    pipeline.shutdown();
    Ok(())
}
