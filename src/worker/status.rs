use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker state machine position as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Stopped,
    Starting,
    Connecting,
    Streaming,
    WsError,
    AudioError,
}

impl StreamStatus {
    /// States in which the pipeline is expected to make forward progress.
    /// Freeze detection only applies to these.
    pub fn should_be_active(self) -> bool {
        matches!(self, Self::Streaming | Self::Connecting | Self::WsError)
    }
}

/// Point-in-time health record for one stream.
///
/// This is the only channel through which the supervisor observes worker
/// internals. Every field is a full replacement, never a delta, so a
/// consumer that misses a snapshot loses nothing but freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: StreamStatus,
    /// Current loudness, 0.0–1.0
    pub rms: f32,
    /// Last partial transcript seen (not necessarily emitted)
    pub partial: String,
    /// Last final transcript
    #[serde(rename = "final")]
    pub final_text: String,
    pub emit_count: u64,
    pub bytes_sent: u64,
    pub msgs_recv: u64,
    pub queue_drops: u64,
    pub queue_size: usize,
    pub last_emit_text: String,
    /// Last inbound event type string
    pub last_event_type: String,
    /// Last service-reported error payload
    pub last_asr_error: String,
    /// Reason for the last session end or restart
    pub last_ws_close: String,
    /// Milliseconds since the last audio frame arrived, if any ever did
    pub audio_age_ms: Option<u64>,
    /// Milliseconds since the last successful outbound send
    pub send_age_ms: Option<u64>,
    /// Milliseconds since the last inbound receive
    pub recv_age_ms: Option<u64>,
    pub capture_alive: bool,
    pub ipc_connected: bool,
    pub capture_last_log: String,
    pub capture_last_err: String,
    /// Truncated sample of the last raw inbound payload
    pub last_raw: String,
    /// Inbound payloads with no extractable transcript
    pub no_transcript_count: u64,
    /// Fatal capture startup error, if any
    pub capture_error: String,
    /// Filled in by the parent supervisor, not the worker
    pub worker_pid: Option<u32>,
    pub worker_alive: bool,
    pub worker_exit: Option<i32>,
}

impl Default for StatusSnapshot {
    /// The baseline "stopped" shape. Consumers never need to special-case
    /// a stream that was never started.
    fn default() -> Self {
        Self {
            status: StreamStatus::Stopped,
            rms: 0.0,
            partial: String::new(),
            final_text: String::new(),
            emit_count: 0,
            bytes_sent: 0,
            msgs_recv: 0,
            queue_drops: 0,
            queue_size: 0,
            last_emit_text: String::new(),
            last_event_type: String::new(),
            last_asr_error: String::new(),
            last_ws_close: String::new(),
            audio_age_ms: None,
            send_age_ms: None,
            recv_age_ms: None,
            capture_alive: false,
            ipc_connected: false,
            capture_last_log: String::new(),
            capture_last_err: String::new(),
            last_raw: String::new(),
            no_transcript_count: 0,
            capture_error: String::new(),
            worker_pid: None,
            worker_alive: false,
            worker_exit: None,
        }
    }
}

/// Event written by the worker to its stdout, one JSON line each, read by
/// the parent supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    Status {
        snapshot: StatusSnapshot,
    },
    Transcript {
        speaker: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_stopped_baseline() {
        let snap = StatusSnapshot::default();
        assert_eq!(snap.status, StreamStatus::Stopped);
        assert_eq!(snap.audio_age_ms, None);
        assert!(!snap.capture_alive);
        assert!(snap.final_text.is_empty());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&StreamStatus::WsError).unwrap();
        assert_eq!(json, "\"ws_error\"");
    }

    #[test]
    fn test_should_be_active() {
        assert!(StreamStatus::Streaming.should_be_active());
        assert!(StreamStatus::Connecting.should_be_active());
        assert!(StreamStatus::WsError.should_be_active());
        assert!(!StreamStatus::Stopped.should_be_active());
        assert!(!StreamStatus::AudioError.should_be_active());
    }

    #[test]
    fn test_worker_event_roundtrip() {
        let event = WorkerEvent::Transcript {
            speaker: "A".to_string(),
            text: "hello".to_string(),
            timestamp: Utc::now(),
        };

        let line = serde_json::to_string(&event).unwrap();
        let parsed: WorkerEvent = serde_json::from_str(&line).unwrap();
        match parsed {
            WorkerEvent::Transcript { speaker, text, .. } => {
                assert_eq!(speaker, "A");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_final_field_renamed_in_json() {
        let json = serde_json::to_string(&StatusSnapshot::default()).unwrap();
        assert!(json.contains("\"final\":"));
        assert!(!json.contains("final_text"));
    }
}
