//! ebbtide - main entry point

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ebbtide::cli::CliArgs;
use ebbtide::{torrent, Client};
use tracing::info;

#[tokio::main]
async fn main() {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // one line for argument problems
            let message = e.to_string();
            eprintln!("error: {}", message.lines().next().unwrap_or("invalid arguments"));
            std::process::exit(1);
        }
    };

    init_logging(&args);

    if let Err(e) = run(args).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(args: &CliArgs) {
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .compact()
        .init();
}

async fn run(args: CliArgs) -> Result<()> {
    if !args.torrent_file.exists() {
        anyhow::bail!("torrent file not found: {}", args.torrent_file.display());
    }
    std::fs::create_dir_all(&args.download_dir).with_context(|| {
        format!("failed to create download directory {}", args.download_dir.display())
    })?;

    let meta = torrent::parse_file(&args.torrent_file).context("failed to load torrent file")?;
    info!(
        "Loaded '{}': {} bytes in {} pieces, {} trackers",
        meta.name,
        meta.total_size(),
        meta.piece_count(),
        meta.trackers.len()
    );

    let mut client = Client::new(Arc::new(meta), args.download_dir, args.port);
    let stopper = client.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = stopper.send(true);
        }
    });

    client.run().await
}
