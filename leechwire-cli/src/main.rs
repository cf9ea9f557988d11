//! Leechwire CLI - Command-line interface
//!
//! Downloads the single file described by a `.torrent` into a directory.

mod commands;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = commands::Cli::parse();
    commands::handle_command(cli).await
}
