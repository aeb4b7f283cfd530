// cpal capture backend.
//
// The cpal stream is !Send, so it lives on a dedicated thread for its whole
// lifetime; the async side only exchanges frames and notes with it.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use super::backend::{CaptureBackend, CaptureBackendConfig, CaptureNote};
use super::frame::{FrameAssembler, PcmFrame};
use crate::queue::BoundedQueue;

pub struct CpalBackend {
    config: CaptureBackendConfig,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
    capturing: bool,
}

impl CpalBackend {
    pub fn new(config: CaptureBackendConfig) -> Self {
        Self {
            config,
            stop_tx: None,
            thread: None,
            capturing: false,
        }
    }
}

#[async_trait::async_trait]
impl CaptureBackend for CpalBackend {
    async fn start(
        &mut self,
        frames: Arc<BoundedQueue<PcmFrame>>,
        notes: mpsc::UnboundedSender<CaptureNote>,
    ) -> Result<()> {
        let config = self.config.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            match open_stream(&config, frames, notes) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream until stop; dropping it closes the device
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        // Wait for the device to open (or fail) without blocking the runtime
        let opened = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .context("capture thread panicked")?
            .context("capture thread exited before reporting")?;
        opened?;

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        self.capturing = true;

        info!(
            "cpal capture started: device={} sr={} ch={} frame={}",
            self.config.device, self.config.sample_rate, self.config.channels, self.config.frame_size
        );

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        self.capturing = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

/// Resolve a device spec: numeric index into the input device list,
/// "default" for the host default, otherwise an exact name match.
fn find_input_device(spec: &str) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if spec.is_empty() || spec == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| anyhow!("no default input device"));
    }

    if let Ok(index) = spec.parse::<usize>() {
        return host
            .input_devices()
            .context("failed to enumerate input devices")?
            .nth(index)
            .ok_or_else(|| anyhow!("no input device at index {}", index));
    }

    let devices = host
        .input_devices()
        .context("failed to enumerate input devices")?;
    for device in devices {
        if device.name().map(|n| n == spec).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(anyhow!("input device not found: {}", spec))
}

fn open_stream(
    config: &CaptureBackendConfig,
    frames: Arc<BoundedQueue<PcmFrame>>,
    notes: mpsc::UnboundedSender<CaptureNote>,
) -> Result<cpal::Stream> {
    let device = find_input_device(&config.device)?;

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_notes = notes.clone();
    let err_fn = move |e: cpal::StreamError| {
        let _ = err_notes.send(CaptureNote::Err(format!("stream_error: {}", e)));
    };

    // Prefer f32 input; fall back to i16 for devices that only expose
    // integer formats.
    let mut assembler = FrameAssembler::new(config.frame_size, config.channels as usize);
    let f32_frames = Arc::clone(&frames);
    let f32_stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for frame in assembler.push(data) {
                f32_frames.push(frame);
            }
        },
        err_fn.clone(),
        None,
    );

    let stream = match f32_stream {
        Ok(stream) => stream,
        Err(_) => {
            let mut assembler = FrameAssembler::new(config.frame_size, config.channels as usize);
            device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let floats: Vec<f32> =
                            data.iter().map(|&s| s as f32 / 32768.0).collect();
                        for frame in assembler.push(&floats) {
                            frames.push(frame);
                        }
                    },
                    err_fn,
                    None,
                )
                .context("failed to build input stream")?
        }
    };

    stream.play().context("failed to start input stream")?;
    Ok(stream)
}
