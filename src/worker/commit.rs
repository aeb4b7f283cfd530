// Transcript-commit decision logic.
//
// The service repeats and grows the same partial text many times per
// utterance. Finals always go out; partials are throttled so the consumer
// sees responsive updates without a firehose of near-duplicate fragments.

use crate::config::CommitSettings;
use std::time::{Duration, Instant};

/// Decides which transcript updates are emitted downstream.
///
/// State is scoped to the owning worker session and survives ASR
/// reconnects within it.
pub struct CommitPolicy {
    settings: CommitSettings,
    last_emit_text: String,
    last_emit_at: Instant,
}

impl CommitPolicy {
    /// `now` is the session start; the time-based emission window opens
    /// `emit_interval_ms` after it, which keeps early low-content partials
    /// from being emitted just because nothing came before them.
    pub fn new(settings: CommitSettings, now: Instant) -> Self {
        Self {
            settings,
            last_emit_text: String::new(),
            last_emit_at: now,
        }
    }

    /// A final commit: always emitted (callers pass non-empty text).
    pub fn offer_final(&mut self, text: &str, now: Instant) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.record_emit(text, now);
        true
    }

    /// A partial update. Emitted immediately when it has grown
    /// substantially and audio is active; otherwise only on the emission
    /// interval, with a longer cooldown before repeating identical text.
    pub fn offer_partial(&mut self, text: &str, rms: f32, now: Instant) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        let has_audio = rms > self.settings.rms_floor;
        if !has_audio {
            return false;
        }

        let since_emit = now.duration_since(self.last_emit_at);
        let growth_target = self
            .settings
            .min_partial_chars
            .max(self.last_emit_text.len() + self.settings.min_growth_chars);

        let grew = text.len() >= growth_target && text != self.last_emit_text;
        let time_ready = since_emit > Duration::from_millis(self.settings.emit_interval_ms);
        let identical = text == self.last_emit_text;
        let duplicate_ok =
            since_emit > Duration::from_millis(self.settings.duplicate_cooldown_ms);

        if grew || (time_ready && (!identical || duplicate_ok)) {
            self.record_emit(text, now);
            return true;
        }

        false
    }

    pub fn last_emit_text(&self) -> &str {
        &self.last_emit_text
    }

    fn record_emit(&mut self, text: &str, now: Instant) {
        self.last_emit_text = text.to_string();
        self.last_emit_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(now: Instant) -> CommitPolicy {
        CommitPolicy::new(CommitSettings::default(), now)
    }

    #[test]
    fn test_growth_emits_immediately() {
        let t0 = Instant::now();
        let mut p = policy(t0);

        // 11 chars, grown from nothing, audio active
        assert!(p.offer_partial("hello there", 0.2, t0 + Duration::from_millis(100)));
    }

    #[test]
    fn test_silence_suppresses_partials() {
        let t0 = Instant::now();
        let mut p = policy(t0);

        assert!(!p.offer_partial("hello there", 0.001, t0 + Duration::from_millis(100)));
    }

    #[test]
    fn test_final_always_emits() {
        let t0 = Instant::now();
        let mut p = policy(t0);

        assert!(p.offer_final("ok", t0));
        assert!(p.offer_final("ok", t0 + Duration::from_millis(1)));
    }

    #[test]
    fn test_empty_text_never_emits() {
        let t0 = Instant::now();
        let mut p = policy(t0);

        assert!(!p.offer_final("   ", t0));
        assert!(!p.offer_partial("", 0.5, t0));
    }
}
