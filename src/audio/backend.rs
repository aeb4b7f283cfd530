use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame::PcmFrame;
use crate::queue::BoundedQueue;

/// Diagnostic side-channel from a capture backend. Notes never carry
/// audio; they become `log`/`err` IPC messages.
#[derive(Debug, Clone)]
pub enum CaptureNote {
    Log(String),
    Err(String),
}

/// Configuration for a capture backend
#[derive(Debug, Clone)]
pub struct CaptureBackendConfig {
    /// Device identifier (numeric index, device name, or "default")
    pub device: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channels to open on the device
    pub channels: u16,
    /// Samples per emitted frame
    pub frame_size: usize,
}

/// Audio capture backend trait
///
/// The capture process only ever talks to this interface, so the real
/// cpal device can be swapped for a fake that replays a fixed frame
/// sequence in tests.
#[async_trait::async_trait]
pub trait CaptureBackend: Send {
    /// Start capturing. Complete frames are pushed into `frames`
    /// (drop-oldest under pressure); diagnostics go to `notes`.
    async fn start(
        &mut self,
        frames: Arc<BoundedQueue<PcmFrame>>,
        notes: mpsc::UnboundedSender<CaptureNote>,
    ) -> Result<()>;

    /// Stop capturing and release the device.
    async fn stop(&mut self) -> Result<()>;

    /// Check if the backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Test backend that replays a fixed frame sequence at a fixed interval.
pub struct FakeBackend {
    frames: Vec<PcmFrame>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
    capturing: bool,
}

impl FakeBackend {
    pub fn new(frames: Vec<PcmFrame>, interval: Duration) -> Self {
        Self {
            frames,
            interval,
            task: None,
            capturing: false,
        }
    }
}

#[async_trait::async_trait]
impl CaptureBackend for FakeBackend {
    async fn start(
        &mut self,
        frames: Arc<BoundedQueue<PcmFrame>>,
        notes: mpsc::UnboundedSender<CaptureNote>,
    ) -> Result<()> {
        let replay = self.frames.clone();
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            for frame in replay {
                frames.push(frame);
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
            let _ = notes.send(CaptureNote::Log("fake capture drained".to_string()));
        }));
        self.capturing = true;

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.capturing = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "fake"
    }
}
