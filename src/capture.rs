// Capture process entry point.
//
// Runs in its own OS process so device callbacks never share a scheduler
// with websocket I/O. Frames flow: device callback -> drop-oldest queue ->
// drain loop -> IPC. Everything that goes wrong on the callback side is
// reported as an `err` message; an IPC transport failure ends the process
// and the owning worker respawns it.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::audio::{CaptureBackend, CaptureBackendConfig, CaptureNote, CpalBackend};
use crate::config::Settings;
use crate::ipc::{CaptureMessage, IpcSender};
use crate::queue::BoundedQueue;

/// Drain-loop wait before a keepalive is sent, so the worker can tell
/// "quiet" from "dead".
const KEEPALIVE_AFTER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct CaptureArgs {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub port: u16,
    pub label: String,
}

pub async fn run(args: CaptureArgs) -> Result<()> {
    let settings = Settings::load().unwrap_or_else(|e| {
        warn!("failed to load settings, using defaults: {:#}", e);
        Settings::default()
    });

    let mut ipc = IpcSender::connect(args.port)
        .await
        .context("failed to reach owning worker")?;

    let banner = format!(
        "capture start label={} device={} sr={} ch={} frame={}",
        args.label, args.device, args.sample_rate, args.channels, args.frame_size
    );
    info!("{}", banner);
    let _ = ipc.send(&CaptureMessage::log(banner)).await;

    let frames = Arc::new(BoundedQueue::new(settings.buffers.capture_queue_frames));
    let (notes_tx, notes_rx) = mpsc::unbounded_channel();

    let mut backend = CpalBackend::new(CaptureBackendConfig {
        device: args.device.clone(),
        sample_rate: args.sample_rate,
        channels: args.channels,
        frame_size: args.frame_size,
    });

    if let Err(e) = backend.start(Arc::clone(&frames), notes_tx).await {
        let _ = ipc
            .send(&CaptureMessage::err(format!("stream_error: {:#}", e)))
            .await;
        return Err(e);
    }

    let result = drain(&mut ipc, &frames, notes_rx).await;

    backend.stop().await.ok();
    if let Err(e) = &result {
        warn!("capture drain ended: {:#}", e);
    }
    result
}

/// Forward frames and diagnostics until the IPC link drops. No reconnect
/// here; restart policy belongs to the worker.
async fn drain(
    ipc: &mut IpcSender,
    frames: &BoundedQueue<crate::audio::PcmFrame>,
    mut notes: mpsc::UnboundedReceiver<CaptureNote>,
) -> Result<()> {
    loop {
        while let Ok(note) = notes.try_recv() {
            let msg = match note {
                CaptureNote::Log(text) => CaptureMessage::log(text),
                CaptureNote::Err(text) => CaptureMessage::err(text),
            };
            ipc.send(&msg).await?;
        }

        match frames.pop_timeout(KEEPALIVE_AFTER).await {
            Some(frame) => {
                ipc.send(&CaptureMessage::pcm(frame.ts_ms, frame.rms, &frame.pcm))
                    .await?;
            }
            None => {
                ipc.send(&CaptureMessage::log("keepalive")).await?;
            }
        }
    }
}
