// Freeze detection.
//
// A worker is "frozen" when audio keeps arriving and frames are queued,
// yet neither sends nor receives make progress: the process is alive but
// the pipeline inside it has wedged. A wedged scheduler cannot be trusted
// to self-heal, so the parent hard-restarts it.

use crate::config::FreezeSettings;
use crate::worker::StatusSnapshot;
use std::time::{Duration, Instant};

/// Pure freeze predicate over one status snapshot. Returns a diagnostic
/// reason when the snapshot looks frozen.
pub fn freeze_reason(snap: &StatusSnapshot, settings: &FreezeSettings) -> Option<String> {
    if !snap.status.should_be_active() {
        return None;
    }

    // Audio must be actively arriving with work queued; otherwise the
    // stream is legitimately idle, not stuck.
    let audio_age = snap.audio_age_ms?;
    if audio_age >= settings.audio_fresh_ms || snap.queue_size < settings.min_queue {
        return None;
    }

    let send_stalled = snap.send_age_ms.map_or(false, |age| age > settings.stall_ms);
    let recv_stalled = snap.recv_age_ms.map_or(false, |age| age > settings.stall_ms);
    if !(send_stalled || recv_stalled) {
        return None;
    }

    Some(format!(
        "ParentRestart: frozen (send_age={}, recv_age={}, queue={})",
        snap.send_age_ms.map_or("none".to_string(), |a| a.to_string()),
        snap.recv_age_ms.map_or("none".to_string(), |a| a.to_string()),
        snap.queue_size
    ))
}

/// Stateful wrapper that rate-limits restart decisions: after one freeze
/// fires, further detections are suppressed for the restart cooldown so a
/// recovering worker is not killed again mid-startup.
pub struct FreezeDetector {
    settings: FreezeSettings,
    cooldown_until: Option<Instant>,
}

impl FreezeDetector {
    pub fn new(settings: FreezeSettings) -> Self {
        Self {
            settings,
            cooldown_until: None,
        }
    }

    /// Evaluate one snapshot. A `Some` return means restart now.
    pub fn check(&mut self, snap: &StatusSnapshot, now: Instant) -> Option<String> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return None;
            }
        }

        let reason = freeze_reason(snap, &self.settings)?;
        self.cooldown_until =
            Some(now + Duration::from_millis(self.settings.restart_cooldown_ms));
        Some(reason)
    }
}
