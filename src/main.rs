//! Mockwire CLI

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mockwire::config::Config;
use mockwire::network::MockServer;
use mockwire::recording::{Direction, Recording};

#[derive(Parser, Debug)]
#[command(name = "mockwire", version, about = "WebSocket record/replay mock server")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "mockwire=info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the mock server
    Serve {
        /// TOML configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Summarize a recording
    Inspect {
        /// Recording JSON file
        recording: PathBuf,
        /// Print every frame
        #[arg(long)]
        frames: bool,
    },
    /// Validate a configuration file
    CheckConfig {
        /// TOML configuration file
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Command::Serve { config } => serve(&config),
        Command::Inspect { recording, frames } => inspect(&recording, frames),
        Command::CheckConfig { config } => check_config(&config),
    };

    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn serve(path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(async move {
        let server = MockServer::bind(config)
            .await
            .context("Failed to start server")?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, shutting down");
            }
            signal.cancel();
        });

        server.run(shutdown).await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn inspect(path: &Path, show_frames: bool) -> anyhow::Result<()> {
    let recording = Recording::from_json_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    println!("Recording: {}", recording.id);
    println!("Protocol:  {:?}", recording.protocol);
    if let Some(path) = &recording.endpoint_path {
        println!("Endpoint:  {path}");
    }
    if let Some(subprotocol) = &recording.subprotocol {
        println!("Subprotocol: {subprotocol}");
    }
    println!(
        "Frames:    {} ({} server, {} client)",
        recording.frames.len(),
        recording.server_frame_count(),
        recording.frames.len() - recording.server_frame_count()
    );
    println!("Duration:  {}ms", recording.duration().as_millis());
    if let Some(close) = &recording.close {
        println!("Closed:    {} {}", close.code, close.reason);
    }

    if show_frames {
        println!();
        println!("{:>6} {:>8}  {:<4} {:<6} {:>8}", "seq", "at(ms)", "dir", "type", "bytes");
        for frame in &recording.frames {
            let arrow = match frame.direction {
                Direction::ClientToServer => "->",
                Direction::ServerToClient => "<-",
            };
            println!(
                "{:>6} {:>8}  {:<4} {:<6} {:>8}",
                frame.sequence,
                frame.relative_ms,
                arrow,
                format!("{:?}", frame.message_type).to_lowercase(),
                frame.data_size
            );
        }
    }

    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    let replay = config.replay_config()?;

    println!("Configuration OK: {}", path.display());
    println!("  mode:        {:?}", config.mode);
    println!("  listen_addr: {}", config.server.listen_addr);
    if config.mode.is_replay() {
        println!("  replay mode: {}", replay.mode.name());
    }
    if config.mode.is_record() {
        println!(
            "  upstream:    {}",
            config.server.upstream_url.as_deref().unwrap_or_default()
        );
        println!("  recording dir: {}", config.recording.dir.display());
    }
    Ok(())
}
