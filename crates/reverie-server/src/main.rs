// crates/reverie-server/src/main.rs
// Reverie - long-term conversational memory for chat characters

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{App, Cli};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn log_level(verbose: bool) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    std::env::var("REVERIE_LOG")
        .ok()
        .and_then(|v| Level::from_str(v.trim()).ok())
        .unwrap_or(Level::WARN)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env files (~/.reverie first, then the working directory)
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".reverie/.env"));
    }
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(cli.verbose))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let app = App::open(&cli).await?;
    let result = cli::commands::run(&app, cli.command).await;
    // Indexing scheduled by the command completes before exit
    app.finish().await;
    result
}
