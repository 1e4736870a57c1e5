//! CLI argument parsing for deltablob

use crate::config::Config;
use crate::error::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// deltablob - block-level delta sync between local files and blob storage
#[derive(Parser, Debug)]
#[command(name = "deltablob")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file path
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Load the configuration file named on the command line, or the default one
    pub fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a local file, sending only blocks the blob does not hold
    Upload(UploadArgs),

    /// Download a blob, reusing matching bytes of the local file
    Download(DownloadArgs),

    /// Generate a signature file for a local file
    Sign(SignArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Parse a block size like "512K" or "4M"
fn parse_block_size(s: &str) -> std::result::Result<usize, String> {
    let size = Config::parse_size(s).map_err(|e| e.to_string())?;
    if size == 0 {
        return Err("block size must be positive".to_string());
    }
    usize::try_from(size).map_err(|_| format!("block size {} is too large", size))
}

/// Options shared by commands that talk to a store
#[derive(clap::Args, Debug, Default)]
pub struct StoreArgs {
    /// Root directory of the local store (overrides store.root)
    #[arg(long)]
    pub store_root: Option<PathBuf>,

    /// Azure storage account (selects the azure backend)
    #[arg(long, conflicts_with = "store_root")]
    pub account: Option<String>,
}

impl StoreArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(root) = &self.store_root {
            config.store.backend = crate::config::BackendKind::Local;
            config.store.root = Some(root.clone());
        }
        if let Some(account) = &self.account {
            config.store.backend = crate::config::BackendKind::Azure;
            config.store.account = Some(account.clone());
        }
    }
}

/// Arguments for the upload command
#[derive(Parser, Debug)]
pub struct UploadArgs {
    /// Local file to upload
    pub file: PathBuf,

    /// Target container
    pub container: String,

    /// Target blob name
    pub blob: String,

    /// Block size for new blocks, e.g. 512K or 4M [default: derived from file size]
    #[arg(long, value_parser = parse_block_size)]
    pub block_size: Option<usize>,

    /// Number of concurrent block uploads [default: from config]
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    #[command(flatten)]
    pub store: StoreArgs,
}

impl UploadArgs {
    /// Apply command line overrides on top of the file configuration
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(jobs) = self.jobs {
            config.parallelism = jobs;
        }
        self.store.apply(config);
        config.validate()
    }
}

/// Arguments for the download command
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// Source container
    pub container: String,

    /// Source blob name
    pub blob: String,

    /// Local file to create or update
    pub file: PathBuf,

    /// Skip content hash verification
    #[arg(long)]
    pub no_verify: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

impl DownloadArgs {
    /// Apply command line overrides on top of the file configuration
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if self.no_verify {
            config.verify_downloads = false;
        }
        self.store.apply(config);
        config.validate()
    }
}

/// Arguments for the sign command
#[derive(Parser, Debug)]
pub struct SignArgs {
    /// File to generate signature for
    pub file: PathBuf,

    /// Output signature file path (default: <file><signature_suffix>)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Block size, e.g. 512K or 4M [default: derived from file size]
    #[arg(long, value_parser = parse_block_size)]
    pub block_size: Option<usize>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show the configuration file path
    #[arg(long)]
    pub path: bool,

    /// Create default configuration file
    #[arg(long)]
    pub init: bool,
}
