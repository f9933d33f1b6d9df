//! CLI binary for medpredict-live.

use clap::{Parser, Subcommand};
use medpredict_live::audio::capture::CpalCapture;
use medpredict_live::audio::playback::CpalPlayback;
use medpredict_live::{LiveConfig, LiveSession, SessionState};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// MedPredict Live: talk to the health assistant in real time.
#[derive(Parser)]
#[command(name = "medpredict-live", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a live voice consult.
    Consult,

    /// List available audio devices.
    Devices,

    /// Print the effective configuration as TOML.
    Config {
        /// Also write it to the config file (`--config` or the default path).
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("medpredict_live=info,tungstenite=warn,tokio_tungstenite=warn")
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Consult) {
        Command::Consult => run_consult(config).await,
        Command::Devices => list_devices(),
        Command::Config { save } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if save {
                let path = cli.config.unwrap_or_else(LiveConfig::default_config_path);
                config.save_to_file(&path)?;
                println!("\nSaved to {}", path.display());
            }
            Ok(())
        }
    }
}

/// Explicit path, else the default location if present, else built-in defaults.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<LiveConfig> {
    if let Some(path) = path {
        return Ok(LiveConfig::from_file(path)?);
    }
    let default_path = LiveConfig::default_config_path();
    if default_path.is_file() {
        info!("loading config from {}", default_path.display());
        return Ok(LiveConfig::from_file(&default_path)?);
    }
    Ok(LiveConfig::default())
}

async fn run_consult(config: LiveConfig) -> anyhow::Result<()> {
    println!("MedPredict Live v{}", env!("CARGO_PKG_VERSION"));

    let session = LiveSession::with_defaults(config);
    let mut states = session.subscribe();

    println!("Connecting...");
    session.start().await?;
    println!("\nReady! Describe your symptoms. Press Ctrl+C to end the consult.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down...");
                session.stop().await;
                break;
            }
            state = states.recv() => match state {
                Ok(SessionState::Closed(reason)) => {
                    println!("[closed] {reason}");
                    break;
                }
                Ok(state) => println!("[{state}]"),
                Err(RecvError::Lagged(n)) => warn!("missed {n} state changes"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let reason = session.wait_closed().await;
    let stats = session.stats();
    println!(
        "\nConsult ended ({reason}). Sent {} frames ({} dropped), played {} of {} received ({} undecodable, {} underruns).",
        stats.frames_sent,
        stats.frames_dropped,
        stats.frames_played,
        stats.frames_received,
        stats.codec_errors,
        stats.underruns,
    );

    if reason.is_failure() {
        anyhow::bail!("consult ended with an error: {reason}");
    }
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalPlayback::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
