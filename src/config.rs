use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable configuration for one audio stream, created once per start().
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Input device identifier (numeric index, device name, or "default")
    pub device: String,
    /// Logical stream label ("mic" or "system")
    pub label: String,
    /// Speaker tag attached to emitted transcripts ("A" or "B")
    pub speaker: String,
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Samples per frame (960 = 20ms at 48kHz)
    pub frame_size: usize,
    /// Channels opened on the device; only the left channel is kept
    /// downstream to avoid stereo phase-cancellation artifacts
    pub channels: u16,
    /// Throttle outbound sends to real time instead of draining in batches
    pub paced_send: bool,
}

impl StreamConfig {
    /// Config for the microphone stream (speaker A).
    pub fn mic(device: impl Into<String>) -> Self {
        Self::new(device, "mic", "A")
    }

    /// Config for the system/loopback stream (speaker B).
    pub fn system(device: impl Into<String>) -> Self {
        Self::new(device, "system", "B")
    }

    pub fn new(device: impl Into<String>, label: &str, speaker: &str) -> Self {
        Self {
            device: device.into(),
            label: label.to_string(),
            speaker: speaker.to_string(),
            sample_rate: 48000,
            frame_size: 960,
            channels: 2,
            paced_send: false,
        }
    }

    /// Wall-clock duration of one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

/// Transcript commit thresholds (see `worker::CommitPolicy`).
///
/// These values are tuned empirically; change them through configuration,
/// not in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSettings {
    /// A partial must have grown by at least this many characters
    /// relative to the last emitted text to be emitted immediately
    pub min_growth_chars: usize,
    /// ...and must be at least this long in total
    pub min_partial_chars: usize,
    /// RMS floor below which the stream counts as silent
    pub rms_floor: f32,
    /// Minimum gap between time-based partial emissions
    pub emit_interval_ms: u64,
    /// A partial identical to the last emission may still surface after
    /// this much time (lets a stalled-but-unchanged partial through)
    pub duplicate_cooldown_ms: u64,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            min_growth_chars: 6,
            min_partial_chars: 8,
            rms_floor: 0.01,
            emit_interval_ms: 1_000,
            duplicate_cooldown_ms: 2_000,
        }
    }
}

/// Freeze detection thresholds (see `supervisor::FreezeDetector`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeSettings {
    /// Send/receive age beyond which the worker counts as stalled
    pub stall_ms: u64,
    /// Audio age below which audio counts as actively arriving
    pub audio_fresh_ms: u64,
    /// Minimum queued frames for a stall to count as a freeze
    pub min_queue: usize,
    /// No second restart within this window after a freeze restart
    pub restart_cooldown_ms: u64,
    /// Pause between hard-stop and respawn
    pub restart_pause_ms: u64,
    /// Pause after respawn before monitoring resumes
    pub resume_pause_ms: u64,
}

impl Default for FreezeSettings {
    fn default() -> Self {
        Self {
            stall_ms: 12_000,
            audio_fresh_ms: 1_500,
            min_queue: 5,
            restart_cooldown_ms: 1_500,
            restart_pause_ms: 500,
            resume_pause_ms: 1_000,
        }
    }
}

/// Queue capacities. Every queue drops entries under pressure rather than
/// blocking its producer (drop-oldest for audio, drop-newest for telemetry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Capture-process frame queue (~5s of audio at 20ms frames)
    pub capture_queue_frames: usize,
    /// Worker-internal frame buffer soft cap
    pub worker_queue_frames: usize,
    /// Max frames drained per sender iteration
    pub send_batch_max: usize,
    /// Parent-side status snapshot channel capacity
    pub status_queue: usize,
    /// Parent-side transcript channel capacity
    pub text_queue: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capture_queue_frames: 250,
            worker_queue_frames: 200,
            send_batch_max: 32,
            status_queue: 200,
            text_queue: 500,
        }
    }
}

/// Reconnect backoff for the ASR session retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 5_000,
            multiplier: 1.7,
        }
    }
}

/// Pipeline settings shared by all three process tiers.
///
/// Layering: built-in defaults, then `config/dualscribe.toml` if present,
/// then `DUALSCRIBE_*` environment variables (e.g.
/// `DUALSCRIBE_FREEZE__STALL_MS=20000`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub commit: CommitSettings,
    pub freeze: FreezeSettings,
    pub buffers: BufferSettings,
    pub backoff: BackoffSettings,
    /// Throttle outbound audio to real time (one frame per frame
    /// duration) instead of draining the buffer in bursts
    pub paced_send: bool,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let defaults = config::Config::try_from(&Settings::default())?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("config/dualscribe").required(false))
            .add_source(config::Environment::with_prefix("DUALSCRIBE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paced_send_defaults_off() {
        assert!(!Settings::default().paced_send);
        assert!(!StreamConfig::mic("default").paced_send);
    }

    #[test]
    fn test_paced_send_configurable() {
        let settings: Settings = serde_json::from_str(r#"{"paced_send": true}"#).unwrap();
        assert!(settings.paced_send);
    }

    #[test]
    fn test_frame_duration() {
        let config = StreamConfig::mic("default");
        assert_eq!(config.frame_duration(), Duration::from_millis(20));
    }
}
