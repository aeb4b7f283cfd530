// Local IPC between a StreamWorker and the capture process it spawns.
//
// Loopback TCP, one listener per stream and exactly one accepted connection
// per capture-process lifetime. The first line of a connection must be the
// shared secret; after that, each line is one JSON-encoded message. PCM
// payloads travel base64-encoded inside the message.

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Fixed credential shared by the worker and the capture process it spawns.
/// The listener only ever binds to loopback; the secret guards against
/// another local process connecting first.
pub const IPC_SECRET: &str = "dualscribe-capture";

/// How long the worker waits for the handshake line after accepting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Message from the capture process to its owning worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureMessage {
    /// One mono PCM16 frame with capture timestamp and loudness
    Pcm { ts_ms: u64, rms: f32, pcm: String },
    /// Diagnostic line (also used as a keepalive during silence)
    Log { text: String },
    /// Capture-side error, reported instead of propagated
    Err { text: String },
}

impl CaptureMessage {
    pub fn pcm(ts_ms: u64, rms: f32, bytes: &[u8]) -> Self {
        Self::Pcm {
            ts_ms,
            rms,
            pcm: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn log(text: impl Into<String>) -> Self {
        Self::Log { text: text.into() }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self::Err { text: text.into() }
    }

    /// Decode the PCM payload, if this is a `pcm` message.
    pub fn decode_pcm(&self) -> Option<(u64, f32, Vec<u8>)> {
        match self {
            Self::Pcm { ts_ms, rms, pcm } => base64::engine::general_purpose::STANDARD
                .decode(pcm)
                .ok()
                .map(|bytes| (*ts_ms, *rms, bytes)),
            _ => None,
        }
    }
}

/// Worker-side listening endpoint, bound before the capture process is
/// spawned so the port can be passed to the child.
pub struct IpcListener {
    inner: TcpListener,
}

impl IpcListener {
    pub async fn bind() -> Result<Self> {
        let inner = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("failed to bind IPC listener")?;
        Ok(Self { inner })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.inner.local_addr()?.port())
    }

    /// Accept the capture connection and verify the shared secret.
    pub async fn accept(&self) -> Result<IpcReceiver> {
        let (stream, _) = self
            .inner
            .accept()
            .await
            .context("failed to accept IPC connection")?;

        let mut lines = BufReader::new(stream).lines();

        let handshake = timeout(HANDSHAKE_TIMEOUT, lines.next_line())
            .await
            .context("IPC handshake timed out")?
            .context("IPC handshake read failed")?;

        match handshake {
            Some(line) if line == IPC_SECRET => Ok(IpcReceiver { lines }),
            Some(_) => bail!("IPC handshake rejected: bad secret"),
            None => bail!("IPC peer closed before handshake"),
        }
    }
}

/// Worker-side read half of an accepted capture connection.
pub struct IpcReceiver {
    lines: Lines<BufReader<TcpStream>>,
}

impl IpcReceiver {
    /// Read the next message, waiting at most `wait`.
    ///
    /// `Ok(None)` means nothing arrived in time (the caller stays
    /// responsive to its stop flag); closed or failed connections are
    /// errors so the owner restarts the capture process.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<CaptureMessage>> {
        match timeout(wait, self.lines.next_line()).await {
            Err(_) => Ok(None),
            Ok(Ok(Some(line))) => {
                let msg = serde_json::from_str(&line).context("malformed IPC message")?;
                Ok(Some(msg))
            }
            Ok(Ok(None)) => bail!("IPC connection closed"),
            Ok(Err(e)) => Err(e).context("IPC read failed"),
        }
    }
}

/// Capture-side client: connects to the worker's listener and streams
/// messages. No internal reconnect; a transport failure ends the capture
/// process and the worker restarts it.
pub struct IpcSender {
    stream: TcpStream,
}

impl IpcSender {
    pub async fn connect(port: u16) -> Result<Self> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .context("failed to connect to worker IPC")?;

        stream
            .write_all(format!("{}\n", IPC_SECRET).as_bytes())
            .await
            .context("failed to send IPC handshake")?;

        Ok(Self { stream })
    }

    pub async fn send(&mut self, msg: &CaptureMessage) -> Result<()> {
        let mut line = serde_json::to_string(msg).context("failed to encode IPC message")?;
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .await
            .context("IPC send failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_roundtrip() {
        let bytes = vec![0u8, 1, 2, 255];
        let msg = CaptureMessage::pcm(42, 0.5, &bytes);

        let (ts, rms, decoded) = msg.decode_pcm().unwrap();
        assert_eq!(ts, 42);
        assert!((rms - 0.5).abs() < f32::EPSILON);
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn test_log_is_not_pcm() {
        assert!(CaptureMessage::log("keepalive").decode_pcm().is_none());
    }

    #[test]
    fn test_tagged_encoding() {
        let json = serde_json::to_string(&CaptureMessage::log("hi")).unwrap();
        assert!(json.contains("\"kind\":\"log\""));

        let parsed: CaptureMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            CaptureMessage::Log { text } => assert_eq!(text, "hi"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
