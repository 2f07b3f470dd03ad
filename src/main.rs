//! netdefrag entry point.
//!
//! Provides a command-line interface for replaying captures through the reassembly
//! engine, handling configuration loading, and initializing the logging subsystem.
//!
//! The configuration path can come from the command line or the environment.

use clap::{Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netdefrag::{
    config::{parse_duration, Config},
    defrag::pcap::{write_reassembled, ReplayOptions},
    errors::{Error, Result},
    replay_capture,
};

/// netdefrag - IPv4/IPv6 fragment reassembly.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "NETDEFRAG_CONFIG",
        default_value = "/etc/netdefrag/config.yml",
        global = true
    )]
    config: PathBuf,

    /// Log level.
    #[arg(long, value_name = "LEVEL", default_value = "", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a pcap capture and report the reassembled packets
    Replay {
        /// Capture file to read
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Stop once nothing was reassembled for this long
        #[arg(long, default_value = "500ms")]
        settle: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Print the metrics after the report
        #[arg(long)]
        metrics: bool,

        /// Write the reassembled packets to this capture file
        #[arg(short, long, value_name = "FILE")]
        write: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

/// Application entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    let log_level = if cli.log_level.is_empty() {
        config.log.level.clone()
    } else {
        cli.log_level.clone()
    };
    setup_logging(&log_level)?;
    cli_main(cli, config).await
}

pub async fn cli_main(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Replay {
            file,
            settle,
            json,
            metrics,
            write,
        } => {
            let options = ReplayOptions {
                settle: parse_duration(&settle)?,
                keep_packets: write.is_some(),
            };
            replay(&config, file, options, json, metrics, write).await?;
        }
        Commands::Config => {
            print!("{}", config.to_yaml()?);
        }
    }
    Ok(())
}

/// Replay a capture and print what came out of it
///
/// # Arguments
/// * `config` - Loaded configuration
/// * `file` - Capture to replay
/// * `options` - Replay settings
/// * `json` - Print JSON instead of the text report
/// * `metrics` - Append the prometheus text exposition
/// * `write` - Optional capture file for the reassembled packets
async fn replay(
    config: &Config,
    file: PathBuf,
    options: ReplayOptions,
    json: bool,
    metrics: bool,
    write: Option<PathBuf>,
) -> Result<()> {
    let report = replay_capture(config, &file, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }

    if let Some(path) = write {
        let written = write_reassembled(&report, &path)?;
        info!("wrote {written} packets to {}", path.display());
    }

    if metrics {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| Error::Runtime(format!("failed to encode metrics: {e}")))?;
        print!("{}", String::from_utf8_lossy(&buffer));
    }
    Ok(())
}

/// Configures the logging subsystem based on the specified log level.
///
/// # Arguments
/// * `level` - String representation of the desired log level
fn setup_logging(level: &str) -> Result<()> {
    let filter: EnvFilter = format!("netdefrag={level}")
        .parse()
        .map_err(|e| Error::InvalidOption(format!("invalid log level {level}: {e}")))?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
    Ok(())
}
