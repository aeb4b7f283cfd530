use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use dualscribe::capture::CaptureArgs;
use dualscribe::{DualPipelineManager, Settings, StreamConfig};

#[derive(Parser)]
#[command(name = "dualscribe", about = "Supervised dual-stream live transcription")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dual pipeline and print committed transcripts
    Run {
        /// Microphone input device (index, name, or "default")
        #[arg(long, default_value = "default")]
        mic: String,
        /// System/loopback input device (index, name, or "default")
        #[arg(long, default_value = "default")]
        system: String,
    },
    /// Internal: stream worker process
    #[command(hide = true)]
    StreamWorker {
        /// Stream configuration as JSON
        #[arg(long)]
        spec: String,
    },
    /// Internal: audio capture process
    #[command(hide = true)]
    Capture {
        #[arg(long)]
        device: String,
        #[arg(long, default_value_t = 48000)]
        sample_rate: u32,
        #[arg(long, default_value_t = 2)]
        channels: u16,
        #[arg(long, default_value_t = 960)]
        frame_size: usize,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "")]
        label: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is the worker->parent protocol channel; all logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { mic, system } => run_pipeline(&mic, &system).await,
        Command::StreamWorker { spec } => {
            let config: StreamConfig =
                serde_json::from_str(&spec).context("invalid stream config")?;
            dualscribe::worker::run(config).await
        }
        Command::Capture {
            device,
            sample_rate,
            channels,
            frame_size,
            port,
            label,
        } => {
            dualscribe::capture::run(CaptureArgs {
                device,
                sample_rate,
                channels,
                frame_size,
                port,
                label,
            })
            .await
        }
    }
}

async fn run_pipeline(mic: &str, system: &str) -> Result<()> {
    let settings = Settings::load()?;

    let manager = DualPipelineManager::new(
        settings,
        Arc::new(|speaker: &str, text: &str| {
            println!("[{}] {}", speaker, text);
        }),
    )?;

    manager.start(mic, system).await?;
    info!("pipeline running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("stopping");
    manager.stop().await;

    Ok(())
}
