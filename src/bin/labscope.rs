//! Command-line inspection of telemetry files
//!
//! ```bash
//! labscope header run.lscp
//! labscope stats run.lscp --channel pressure
//! labscope resample run.lscp --channel pressure --max-points 500 --start-ms 0 --end-ms 10000
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labscope::codec::{read_file, read_header};
use labscope::resample::resample;
use labscope::{ChannelStatistics, EngineConfig, TimeWindow};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "labscope")]
#[command(about = "Inspect and resample binary lab telemetry", long_about = None)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the header and channel table
    Header {
        file: PathBuf,
    },

    /// Print summary statistics of every channel, or one
    Stats {
        file: PathBuf,

        #[arg(long)]
        channel: Option<String>,
    },

    /// Reduce one channel to at most `max_points` points
    Resample {
        file: PathBuf,

        #[arg(long)]
        channel: String,

        #[arg(long, default_value = "1000")]
        max_points: usize,

        #[arg(long)]
        start_ms: Option<f64>,

        #[arg(long)]
        end_ms: Option<f64>,
    },
}

#[derive(Serialize)]
struct ChannelSummary<'a> {
    channel: &'a str,
    unit: &'a str,
    #[serde(flatten)]
    statistics: ChannelStatistics,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Header { file } => print_header(&file).await,
        Commands::Stats { file, channel } => print_stats(&config, &file, channel.as_deref()).await,
        Commands::Resample {
            file,
            channel,
            max_points,
            start_ms,
            end_ms,
        } => {
            let window = TimeWindow::new(start_ms, end_ms);
            print_resampled(&config, &file, &channel, window, max_points).await
        }
    }
}

async fn print_header(file: &Path) -> Result<()> {
    let header = read_header(file)
        .await
        .with_context(|| format!("reading header of {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&header)?);
    Ok(())
}

async fn print_stats(config: &EngineConfig, file: &Path, channel: Option<&str>) -> Result<()> {
    let decoded = read_file(file, &config.stager())
        .await
        .with_context(|| format!("decoding {}", file.display()))?;

    let mut summaries = Vec::new();
    for (descriptor, buffer) in decoded.header.channels.iter().zip(&decoded.buffers) {
        if channel.is_some_and(|c| c != descriptor.id) {
            continue;
        }
        summaries.push(ChannelSummary {
            channel: &descriptor.id,
            unit: &descriptor.unit,
            statistics: ChannelStatistics::from_buffer(buffer),
        });
    }
    if let (Some(channel), true) = (channel, summaries.is_empty()) {
        anyhow::bail!("channel {} not found in {}", channel, file.display());
    }
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

async fn print_resampled(
    config: &EngineConfig,
    file: &Path,
    channel: &str,
    window: TimeWindow,
    max_points: usize,
) -> Result<()> {
    let decoded = read_file(file, &config.stager())
        .await
        .with_context(|| format!("decoding {}", file.display()))?;
    let buffer = decoded
        .buffers
        .iter()
        .find(|b| b.channel_id() == channel)
        .with_context(|| format!("channel {} not found in {}", channel, file.display()))?;

    let series = resample(
        buffer,
        Some(&window),
        max_points,
        &config.resample,
        config.signal_class(channel),
    )?;
    println!("{}", serde_json::to_string_pretty(&series)?);
    Ok(())
}
