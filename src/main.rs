//! deltablob - block-level delta sync between local files and blob storage

use clap::Parser;
use deltablob::cli::{Cli, Commands, ConfigArgs, SignArgs};
use deltablob::config::Config;
use deltablob::format::{format_download, format_size, format_upload};
use deltablob::signature;
use deltablob::storage::open_store;
use deltablob::sync::{self, SyncContext};
use std::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.json);

    // Blobs are committed and local files renamed only at the end of a
    // command, so abandoning it midway leaves their content unchanged. An
    // interrupted upload may leave the blob without its signature hash, and
    // the next upload then sends the whole file.
    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Received Ctrl+C, shutting down...");
            anyhow::bail!("interrupted")
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config();

    match cli.command {
        Commands::Upload(args) => {
            let mut config = config?;
            args.apply(&mut config)?;
            tracing::info!(
                file = %args.file.display(),
                container = %args.container,
                blob = %args.blob,
                "Starting upload"
            );

            let start = Instant::now();
            let ctx = SyncContext::new(config.clone(), open_store(&config)?);
            let report = ctx.upload(&args.file, &args.container, &args.blob).await?;
            println!("{}", format_upload(&report, start.elapsed()));
        }

        Commands::Download(args) => {
            let mut config = config?;
            args.apply(&mut config)?;
            tracing::info!(
                container = %args.container,
                blob = %args.blob,
                file = %args.file.display(),
                "Starting download"
            );

            let start = Instant::now();
            let ctx = SyncContext::new(config.clone(), open_store(&config)?);
            let report = ctx.download(&args.container, &args.blob, &args.file).await?;
            println!("{}", format_download(&report, start.elapsed()));
        }

        Commands::Sign(args) => {
            handle_sign_command(args, config?).await?;
        }

        Commands::Config(args) => {
            handle_config_command(args, config)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("deltablob=info"),
        1 => EnvFilter::new("deltablob=debug"),
        2 => EnvFilter::new("deltablob=trace"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn handle_sign_command(args: SignArgs, mut config: Config) -> anyhow::Result<()> {
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    config.validate()?;

    tracing::info!(file = %args.file.display(), "Generating signature");
    let sig = sync::sign(&config, &args.file).await?;

    let output = args.output.unwrap_or_else(|| {
        let mut name = args.file.clone().into_os_string();
        name.push(&config.signature_suffix);
        name.into()
    });
    signature::write_signature(&sig, &output)?;

    println!(
        "Wrote signature ({} blocks covering {}) to {}",
        sig.block_count(),
        format_size(sig.total_size()),
        output.display()
    );
    Ok(())
}

fn handle_config_command(args: ConfigArgs, config: deltablob::Result<Config>) -> anyhow::Result<()> {
    if args.path {
        println!("{}", Config::default_config_path()?.display());
    } else if args.init {
        Config::default().save()?;
        println!(
            "Created default configuration at {}",
            Config::default_config_path()?.display()
        );
    } else {
        println!("{}", toml::to_string_pretty(&config?)?);
    }
    Ok(())
}
