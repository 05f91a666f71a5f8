//! # btrdiff CLI
//!
//! Inspect btrfs send-streams and the filesystems they describe.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use btrdiff_config::{init_logging, log_cli_debug, Config, LogLevel};
use btrdiff_stream::StreamDecoder;

mod replay;
mod store;

/// btrdiff - btrfs send-stream decoder and reconstruction
#[derive(Parser, Debug)]
#[command(name = "btrdiff")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print one line per command of a send-stream
    Dump {
        #[arg(value_name = "STREAM")]
        stream: PathBuf,

        /// Reject commands with a larger payload
        #[arg(long)]
        max_command_len: Option<u32>,
    },

    /// Reconstruct subvolumes and print every path with its digest
    Replay(replay::ReplayArgs),

    /// Put and get blobs
    Store {
        #[command(subcommand)]
        command: store::StoreCommands,

        /// Storage engine as JSON, e.g. {"name": "cas", "base_dir": "/tmp/blobs"}
        #[arg(long, global = true)]
        storage_json: Option<String>,
    },

    /// Print the default configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = btrdiff_config::config().clone();

    let level = cli
        .log_level
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(LogLevel::Info);
    init_logging(level);
    log_cli_debug!("starting", command = tracing::field::debug(&cli.command));

    run(cli.command, &config)
}

fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Dump {
            stream,
            max_command_len,
        } => cmd_dump(
            &stream,
            max_command_len.unwrap_or(config.decode.max_command_len),
        ),
        Commands::Replay(args) => replay::run(args, config),
        Commands::Store {
            command,
            storage_json,
        } => store::run(command, storage_json.as_deref(), config),
        Commands::Config => {
            print!("{}", Config::default_toml()?);
            Ok(())
        }
    }
}

fn cmd_dump(path: &Path, max_command_len: u32) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let decoder = StreamDecoder::new(BufReader::new(file))
        .with_context(|| format!("Failed to read stream header of {}", path.display()))?
        .with_max_command_len(max_command_len);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (index, item) in decoder.enumerate() {
        let command = item.with_context(|| format!("Failed to decode command {index}"))?;
        writeln!(out, "{command}")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dump() {
        let cli = Cli::try_parse_from(["btrdiff", "dump", "a.stream"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Dump { ref stream, max_command_len: None } if stream == Path::new("a.stream")
        ));
    }

    #[test]
    fn test_parse_global_log_level() {
        let cli = Cli::try_parse_from(["btrdiff", "config", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert!(Cli::try_parse_from(["btrdiff", "config", "--log-level", "loud"]).is_err());
    }

    #[test]
    fn test_store_requires_subcommand() {
        assert!(Cli::try_parse_from(["btrdiff", "store"]).is_err());
        let cli = Cli::try_parse_from([
            "btrdiff",
            "store",
            "get",
            "abc",
            "--storage-json",
            "{}",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Store { storage_json: Some(ref json), .. } if json == "{}"
        ));
    }
}
