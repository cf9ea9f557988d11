//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::Parser;
use leechwire_core::LeechwireError;
use leechwire_core::config::LeechwireConfig;
use leechwire_core::torrent::{self, BencodeParser, EngineOutcome};
use leechwire_core::tracing_setup::{CliLogLevel, init_tracing};

/// Command-line arguments
#[derive(Parser)]
#[command(name = "leechwire")]
#[command(about = "A single-file BitTorrent leecher")]
pub struct Cli {
    /// Path to the .torrent file
    pub torrent: PathBuf,
    /// Port to accept peer connections on
    #[arg(short, long, default_value = "6881")]
    pub port: u16,
    /// Directory the downloaded file is written to
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    pub log_level: CliLogLevel,
    /// Directory for the full trace log
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,
    /// Extra peer to connect to, may be repeated
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,
}

/// Runs one download until interrupted.
///
/// A finished download keeps announcing to the tracker until Ctrl-C.
///
/// # Errors
/// - Tracing could not be initialized
/// - The torrent file is unreadable or invalid
/// - The engine failed to start or a piece could not be written
pub async fn handle_command(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    let config = LeechwireConfig::from_env();
    let metadata = BencodeParser::parse_file(&cli.torrent)
        .await
        .map_err(report)
        .with_context(|| format!("reading {}", cli.torrent.display()))?;

    println!(
        "Downloading {} ({} bytes, {} pieces)",
        metadata.name,
        metadata.total_length,
        metadata.piece_count()
    );

    let mut handle = torrent::start(cli.port, metadata, config, &cli.output)
        .await
        .map_err(report)?;
    println!("Listening for peers on {}", handle.listen_addr());

    for peer in cli.peers {
        if !handle.add_peer(peer) {
            tracing::warn!("Could not queue peer {peer}");
        }
    }

    let mut progress = handle.progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = *progress.borrow();
            println!(
                "  {}/{} pieces, {} bytes left",
                snapshot.completed_pieces, snapshot.total_pieces, snapshot.left
            );
        }
    });

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, stopping download");
            reporter.abort();
            handle.shutdown().await;
            return Ok(());
        }
    };
    reporter.abort();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            handle.shutdown().await;
            return Err(report(e));
        }
    };

    match outcome {
        EngineOutcome::Completed { path, progress } => {
            println!(
                "Download complete: {} ({} bytes)",
                path.display(),
                progress.downloaded
            );
        }
        EngineOutcome::Incomplete { progress } => {
            println!(
                "Download stopped with {}/{} pieces",
                progress.completed_pieces, progress.total_pieces
            );
        }
    }

    println!("Still announcing to the tracker, press Ctrl-C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    handle.shutdown().await;

    Ok(())
}

/// Converts an engine error into the message shown to the user. Errors that
/// are not the user's fault are logged in full first.
fn report(error: impl Into<LeechwireError>) -> anyhow::Error {
    let error = error.into();
    if !error.is_user_error() {
        tracing::error!("{error:?}");
    }
    anyhow!(error.user_message())
}
