//! `btrdiff store`: move blobs in and out of a storage engine.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use btrdiff_config::{log_cli_info, Config};
use btrdiff_store::{with_writer, Storage, StorageRegistry};

#[derive(Subcommand, Debug)]
pub enum StoreCommands {
    /// Store a file and print its blob id
    Put {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Copy a blob to a file or stdout
    Get {
        #[arg(value_name = "ID")]
        id: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn open_storage(storage_json: Option<&str>, config: &Config) -> Result<Box<dyn Storage>> {
    let registry = StorageRegistry::new();
    match storage_json {
        Some(json) => registry
            .from_json(json)
            .context("Failed to build storage from --storage-json"),
        None => registry.from_config(&config.storage).with_context(|| {
            format!(
                "Failed to open {} storage at {}",
                config.storage.engine,
                config.storage.base_dir.display()
            )
        }),
    }
}

pub fn run(command: StoreCommands, storage_json: Option<&str>, config: &Config) -> Result<()> {
    let storage = open_storage(storage_json, config)?;
    match command {
        StoreCommands::Put { file } => {
            let mut input =
                File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?;
            let id = with_writer(storage.as_ref(), |w| -> Result<String> {
                io::copy(&mut input, w)?;
                Ok(w.commit(true)?)
            })?;
            log_cli_info!("stored", engine = storage.name(), id = id.as_str());
            println!("{id}");
        }
        StoreCommands::Get { id, output } => {
            let mut reader = storage
                .open_reader(&id)
                .with_context(|| format!("Failed to open blob {id}"))?;
            let mut out: Box<dyn Write> = match &output {
                Some(path) => Box::new(
                    File::create(path)
                        .with_context(|| format!("Failed to create {}", path.display()))?,
                ),
                None => Box::new(io::stdout().lock()),
            };
            let bytes = io::copy(&mut reader, &mut out)?;
            out.flush()?;
            log_cli_info!("retrieved", id = id.as_str(), bytes = bytes);
        }
    }
    Ok(())
}
