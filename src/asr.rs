// Deepgram live-transcription websocket: URL construction, connection, and
// inbound event parsing. Outbound traffic is raw binary PCM16 frames;
// inbound traffic is JSON text frames.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type AsrStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Environment variable holding the Deepgram API key.
pub const API_KEY_ENV: &str = "DEEPGRAM_API_KEY";

const URL_BASE: &str = "wss://api.deepgram.com/v1/listen\
?model=nova-2\
&punctuate=true\
&smart_format=true\
&encoding=linear16\
&channels=1\
&interim_results=true\
&utterance_end_ms=1000\
&endpointing=200\
&vad_events=true";

/// Streaming endpoint URL for the given runtime sample rate.
pub fn build_url(sample_rate: u32) -> String {
    let sr = if sample_rate == 0 { 48000 } else { sample_rate };
    format!("{}&sample_rate={}", URL_BASE, sr)
}

/// Open the websocket session, authenticated with a bearer token header.
pub async fn connect(url: &str, api_key: &str) -> Result<AsrStream> {
    let mut request = url
        .into_client_request()
        .context("invalid ASR endpoint URL")?;

    let token = HeaderValue::from_str(&format!("Token {}", api_key))
        .context("API key is not a valid header value")?;
    request.headers_mut().insert("Authorization", token);

    let (stream, _response) = connect_async(request)
        .await
        .context("ASR websocket connect failed")?;

    Ok(stream)
}

/// One inbound transcription event. Unknown fields are ignored; missing
/// fields default so a shapeless payload parses to an empty event rather
/// than an error.
#[derive(Debug, Default, Deserialize)]
pub struct AsrEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub speech_final: bool,
    #[serde(default)]
    pub channel: Option<AsrChannel>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AsrChannel {
    #[serde(default)]
    pub alternatives: Vec<AsrAlternative>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AsrAlternative {
    #[serde(default)]
    pub transcript: String,
}

impl AsrEvent {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Transcript text from `channel.alternatives[0].transcript`, trimmed.
    pub fn transcript(&self) -> &str {
        self.channel
            .as_ref()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.trim())
            .unwrap_or("")
    }

    /// True when the service marks this update as a final commit: an
    /// explicit final flag, a speech-final flag, or an end-of-utterance
    /// event.
    pub fn is_commit(&self) -> bool {
        self.is_final
            || self.speech_final
            || self
                .event_type
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case("utteranceend"))
                .unwrap_or(false)
    }

    /// True when the payload carries an error field or is an error-typed
    /// message.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
            || self
                .event_type
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case("error"))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_appends_sample_rate() {
        let url = build_url(48000);
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.ends_with("&sample_rate=48000"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("interim_results=true"));
    }

    #[test]
    fn test_build_url_zero_defaults_to_48k() {
        assert!(build_url(0).ends_with("&sample_rate=48000"));
    }

    #[test]
    fn test_parse_interim_result() {
        let raw = r#"{
            "type": "Results",
            "is_final": false,
            "speech_final": false,
            "channel": {"alternatives": [{"transcript": " hello world "}]}
        }"#;

        let event = AsrEvent::parse(raw).unwrap();
        assert_eq!(event.transcript(), "hello world");
        assert!(!event.is_commit());
        assert!(!event.is_error());
    }

    #[test]
    fn test_parse_final_result() {
        let raw = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {"alternatives": [{"transcript": "done"}]}
        }"#;

        let event = AsrEvent::parse(raw).unwrap();
        assert!(event.is_commit());
    }

    #[test]
    fn test_utterance_end_is_commit() {
        let event = AsrEvent::parse(r#"{"type": "UtteranceEnd"}"#).unwrap();
        assert!(event.is_commit());
        assert_eq!(event.transcript(), "");
    }

    #[test]
    fn test_shapeless_payload_is_empty_not_fatal() {
        let event = AsrEvent::parse(r#"{"unrelated": 1}"#).unwrap();
        assert_eq!(event.transcript(), "");
        assert!(!event.is_commit());
    }

    #[test]
    fn test_non_json_is_none() {
        assert!(AsrEvent::parse("not json").is_none());
    }

    #[test]
    fn test_error_field_detected() {
        let event = AsrEvent::parse(r#"{"error": {"code": 4000}}"#).unwrap();
        assert!(event.is_error());
    }
}
