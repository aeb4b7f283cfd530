// Worker process run loop.
//
// One worker per stream: spawns the capture process, receives PCM over IPC
// into a bounded drop-oldest buffer, streams it to the ASR websocket, and
// turns inbound events into committed transcripts. Session-level failures
// (websocket or IPC) tear down the capture process, back off, and retry;
// nothing short of a stop request ends the loop.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use super::commit::CommitPolicy;
use super::status::{StatusSnapshot, StreamStatus, WorkerEvent};
use crate::asr::{self, AsrEvent, AsrStream};
use crate::config::{Settings, StreamConfig};
use crate::ipc::{CaptureMessage, IpcListener};
use crate::queue::BoundedQueue;

const IPC_POLL: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_millis(500);
const SENDER_IDLE: Duration = Duration::from_millis(5);
const CAPTURE_SETTLE: Duration = Duration::from_millis(200);

/// Truncation limits for diagnostic strings carried in snapshots.
const DIAG_MAX: usize = 300;
const RAW_MAX: usize = 600;
const ERROR_MAX: usize = 800;

/// Mutable worker diagnostics, touched only under the lock and never
/// across an await point.
struct Diag {
    status: StreamStatus,
    level: f32,
    partial: String,
    final_text: String,
    emit_count: u64,
    bytes_sent: u64,
    msgs_recv: u64,
    no_transcript_count: u64,
    last_emit_text: String,
    last_event_type: String,
    last_asr_error: String,
    last_ws_close: String,
    capture_last_log: String,
    capture_last_err: String,
    last_raw: String,
    capture_error: String,
    last_audio: Option<Instant>,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    ipc_connected: bool,
}

impl Diag {
    fn new() -> Self {
        Self {
            status: StreamStatus::Starting,
            level: 0.0,
            partial: String::new(),
            final_text: String::new(),
            emit_count: 0,
            bytes_sent: 0,
            msgs_recv: 0,
            no_transcript_count: 0,
            last_emit_text: String::new(),
            last_event_type: String::new(),
            last_asr_error: String::new(),
            last_ws_close: String::new(),
            capture_last_log: String::new(),
            capture_last_err: String::new(),
            last_raw: String::new(),
            capture_error: String::new(),
            last_audio: None,
            last_send: None,
            last_recv: None,
            ipc_connected: false,
        }
    }
}

struct WorkerContext {
    config: StreamConfig,
    settings: Settings,
    api_key: String,
    diag: Mutex<Diag>,
    buffer: BoundedQueue<Vec<u8>>,
    events: mpsc::Sender<WorkerEvent>,
    capture: Mutex<Option<Child>>,
    commit: Mutex<CommitPolicy>,
}

impl WorkerContext {
    fn set_status(&self, status: StreamStatus) {
        self.diag.lock().unwrap().status = status;
    }

    fn snapshot(&self) -> StatusSnapshot {
        let now = Instant::now();
        let age = |t: Option<Instant>| t.map(|t| now.duration_since(t).as_millis() as u64);

        let capture_alive = {
            let mut capture = self.capture.lock().unwrap();
            match capture.as_mut() {
                Some(child) => child.try_wait().map(|s| s.is_none()).unwrap_or(false),
                None => false,
            }
        };

        let diag = self.diag.lock().unwrap();
        StatusSnapshot {
            status: diag.status,
            rms: diag.level,
            partial: diag.partial.clone(),
            final_text: diag.final_text.clone(),
            emit_count: diag.emit_count,
            bytes_sent: diag.bytes_sent,
            msgs_recv: diag.msgs_recv,
            queue_drops: self.buffer.drops(),
            queue_size: self.buffer.len(),
            last_emit_text: diag.last_emit_text.clone(),
            last_event_type: diag.last_event_type.clone(),
            last_asr_error: diag.last_asr_error.clone(),
            last_ws_close: diag.last_ws_close.clone(),
            audio_age_ms: age(diag.last_audio),
            send_age_ms: age(diag.last_send),
            recv_age_ms: age(diag.last_recv),
            capture_alive,
            ipc_connected: diag.ipc_connected,
            capture_last_log: diag.capture_last_log.clone(),
            capture_last_err: diag.capture_last_err.clone(),
            last_raw: diag.last_raw.clone(),
            no_transcript_count: diag.no_transcript_count,
            capture_error: diag.capture_error.clone(),
            worker_pid: None,
            worker_alive: false,
            worker_exit: None,
        }
    }

    /// Best-effort: a full parent-side channel drops the snapshot, never
    /// blocks the worker.
    fn push_status(&self) {
        let snapshot = self.snapshot();
        let _ = self.events.try_send(WorkerEvent::Status { snapshot });
    }

    fn emit_text(&self, text: &str) {
        {
            let mut diag = self.diag.lock().unwrap();
            diag.emit_count += 1;
            diag.last_emit_text = text.to_string();
        }
        let _ = self.events.try_send(WorkerEvent::Transcript {
            speaker: self.config.speaker.clone(),
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Entry point for the `stream-worker` subcommand.
pub async fn run(config: StreamConfig) -> Result<()> {
    let settings = Settings::load().unwrap_or_else(|e| {
        warn!("failed to load settings, using defaults: {:#}", e);
        Settings::default()
    });

    let api_key = std::env::var(asr::API_KEY_ENV)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .with_context(|| format!("{} is not set", asr::API_KEY_ENV))?;

    let (events_tx, events_rx) = mpsc::channel(settings.buffers.text_queue);
    let writer = tokio::spawn(write_events(events_rx));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(watch_stdin(stop_tx));

    let ctx = Arc::new(WorkerContext {
        buffer: BoundedQueue::new(settings.buffers.worker_queue_frames),
        commit: Mutex::new(CommitPolicy::new(settings.commit.clone(), Instant::now())),
        diag: Mutex::new(Diag::new()),
        capture: Mutex::new(None),
        events: events_tx,
        api_key,
        settings,
        config,
    });

    info!(
        "stream worker starting: label={} speaker={} device={}",
        ctx.config.label, ctx.config.speaker, ctx.config.device
    );
    ctx.push_status();

    let result = run_sessions(&ctx, stop_rx).await;

    kill_capture(&ctx);
    ctx.set_status(StreamStatus::Stopped);
    ctx.push_status();

    // Let the writer flush the final snapshot
    drop(ctx);
    let _ = timeout(Duration::from_secs(1), writer).await;

    result
}

/// Connect-stream-recover loop; exits only on a stop request.
async fn run_sessions(ctx: &Arc<WorkerContext>, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
    let backoff_cfg = ctx.settings.backoff.clone();
    let mut backoff = Duration::from_millis(backoff_cfg.initial_ms);

    let mut listener = match start_capture(ctx).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            record_capture_error(ctx, &e);
            None
        }
    };

    while !*stop_rx.borrow() {
        let Some(active) = listener.take() else {
            // Capture never came up: report and retry on the same backoff
            ctx.set_status(StreamStatus::AudioError);
            ctx.push_status();
            if sleep_or_stop(&mut stop_rx, backoff).await {
                break;
            }
            backoff = next_backoff(backoff, &backoff_cfg);
            match start_capture(ctx).await {
                Ok(l) => listener = Some(l),
                Err(e) => record_capture_error(ctx, &e),
            }
            continue;
        };

        {
            let mut diag = ctx.diag.lock().unwrap();
            diag.status = StreamStatus::Connecting;
            diag.last_ws_close.clear();
        }
        ctx.push_status();

        let res = tokio::select! {
            _ = stop_rx.changed() => break,
            r = ipc_reader(ctx, active) => r,
            r = asr_session(ctx) => r,
        };

        let err = match res {
            Ok(()) => anyhow!("session ended unexpectedly"),
            Err(e) => e,
        };
        warn!("session error on {}: {:#}", ctx.config.label, err);
        {
            let mut diag = ctx.diag.lock().unwrap();
            diag.last_ws_close = truncate(&format!("{:#}", err), ERROR_MAX);
            diag.status = StreamStatus::WsError;
            diag.ipc_connected = false;
        }
        ctx.push_status();

        // An ASR failure does not necessarily mean the capture side died,
        // but restarting both keeps recovery uniform.
        kill_capture(ctx);
        if sleep_or_stop(&mut stop_rx, CAPTURE_SETTLE).await {
            break;
        }
        match start_capture(ctx).await {
            Ok(l) => listener = Some(l),
            Err(e) => {
                let mut diag = ctx.diag.lock().unwrap();
                diag.capture_error = truncate(&format!("restart_capture_failed: {:#}", e), DIAG_MAX);
            }
        }

        if sleep_or_stop(&mut stop_rx, backoff).await {
            break;
        }
        backoff = next_backoff(backoff, &backoff_cfg);
    }

    Ok(())
}

fn next_backoff(current: Duration, cfg: &crate::config::BackoffSettings) -> Duration {
    let grown = current.mul_f64(cfg.multiplier);
    grown.min(Duration::from_millis(cfg.max_ms))
}

/// True if a stop was requested during the pause.
async fn sleep_or_stop(stop_rx: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    tokio::select! {
        _ = sleep(dur) => *stop_rx.borrow(),
        _ = stop_rx.changed() => true,
    }
}

fn record_capture_error(ctx: &WorkerContext, err: &anyhow::Error) {
    warn!("capture start failed on {}: {:#}", ctx.config.label, err);
    let mut diag = ctx.diag.lock().unwrap();
    diag.capture_error = truncate(&format!("{:#}", err), DIAG_MAX);
}

/// Bind a fresh IPC listener and spawn the capture process pointed at it.
/// Exactly one capture process exists at a time.
async fn start_capture(ctx: &WorkerContext) -> Result<IpcListener> {
    kill_capture(ctx);

    let listener = IpcListener::bind().await?;
    let port = listener.port()?;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let cfg = &ctx.config;
    let child = Command::new(exe)
        .arg("capture")
        .arg("--device")
        .arg(&cfg.device)
        .arg("--sample-rate")
        .arg(cfg.sample_rate.to_string())
        .arg("--channels")
        .arg(cfg.channels.to_string())
        .arg("--frame-size")
        .arg(cfg.frame_size.to_string())
        .arg("--port")
        .arg(port.to_string())
        .arg("--label")
        .arg(&cfg.label)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn capture process")?;

    *ctx.capture.lock().unwrap() = Some(child);
    ctx.diag.lock().unwrap().ipc_connected = false;

    Ok(listener)
}

fn kill_capture(ctx: &WorkerContext) {
    if let Some(mut child) = ctx.capture.lock().unwrap().take() {
        let _ = child.start_kill();
    }
}

/// Accept the capture connection, then pump messages into the internal
/// buffer until the link drops.
async fn ipc_reader(ctx: &WorkerContext, listener: IpcListener) -> Result<()> {
    let mut conn = listener.accept().await.context("capture IPC accept failed")?;
    ctx.diag.lock().unwrap().ipc_connected = true;

    loop {
        match conn.recv_timeout(IPC_POLL).await {
            Ok(None) => continue,
            Ok(Some(msg @ CaptureMessage::Pcm { .. })) => {
                if let Some((_ts, rms, bytes)) = msg.decode_pcm() {
                    let mut diag = ctx.diag.lock().unwrap();
                    diag.level = rms;
                    diag.last_audio = Some(Instant::now());
                    drop(diag);
                    ctx.buffer.push(bytes);
                }
            }
            Ok(Some(CaptureMessage::Log { text })) => {
                ctx.diag.lock().unwrap().capture_last_log = truncate(&text, DIAG_MAX);
            }
            Ok(Some(CaptureMessage::Err { text })) => {
                ctx.diag.lock().unwrap().capture_last_err = truncate(&text, DIAG_MAX);
            }
            Err(e) => {
                ctx.diag.lock().unwrap().ipc_connected = false;
                return Err(e).context("capture link lost");
            }
        }
    }
}

/// One websocket session: sender, receiver and status pumper run until the
/// first of them fails, which cancels the others and propagates to the
/// retry loop.
async fn asr_session(ctx: &WorkerContext) -> Result<()> {
    let url = asr::build_url(ctx.config.sample_rate);
    let ws = asr::connect(&url, &ctx.api_key).await?;

    ctx.set_status(StreamStatus::Streaming);
    info!("ASR session open for {}", ctx.config.label);

    let (mut sink, mut stream) = ws.split();
    let sender = send_frames(ctx, &mut sink);
    let receiver = receive_events(ctx, &mut stream);
    let pumper = pump_status(ctx);

    tokio::select! {
        r = sender => r,
        r = receiver => r,
        r = pumper => r,
    }
}

/// Drain the internal buffer in small batches; pace to real time when
/// configured, otherwise just avoid busy-looping on an empty buffer.
async fn send_frames(
    ctx: &WorkerContext,
    sink: &mut SplitSink<AsrStream, Message>,
) -> Result<()> {
    let batch_max = ctx.settings.buffers.send_batch_max;
    let pace = ctx.config.paced_send.then(|| ctx.config.frame_duration());

    loop {
        let mut sent_any = false;
        for _ in 0..batch_max {
            let Some(bytes) = ctx.buffer.pop() else { break };
            let len = bytes.len() as u64;
            sink.send(Message::Binary(bytes))
                .await
                .context("ASR send failed")?;
            {
                let mut diag = ctx.diag.lock().unwrap();
                diag.bytes_sent += len;
                diag.last_send = Some(Instant::now());
            }
            sent_any = true;
            if let Some(gap) = pace {
                sleep(gap).await;
            }
        }
        if !sent_any {
            sleep(SENDER_IDLE).await;
        }
    }
}

/// Read inbound frames until the transport closes or errors; both end the
/// session. Malformed payloads are counted and skipped, never fatal.
async fn receive_events(
    ctx: &WorkerContext,
    stream: &mut SplitStream<AsrStream>,
) -> Result<()> {
    loop {
        let msg = stream
            .next()
            .await
            .ok_or_else(|| anyhow!("websocket closed"))?
            .context("websocket error")?;

        match msg {
            Message::Text(raw) => handle_inbound(ctx, &raw),
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(anyhow!("websocket closed by peer: {}", reason));
            }
            _ => {}
        }
    }
}

fn handle_inbound(ctx: &WorkerContext, raw: &str) {
    let now = Instant::now();

    {
        let mut diag = ctx.diag.lock().unwrap();
        diag.msgs_recv += 1;
        diag.last_recv = Some(now);
        diag.last_raw = truncate(raw, RAW_MAX);
    }

    let Some(event) = AsrEvent::parse(raw) else {
        ctx.diag.lock().unwrap().no_transcript_count += 1;
        return;
    };

    let level = {
        let mut diag = ctx.diag.lock().unwrap();
        if let Some(t) = &event.event_type {
            diag.last_event_type = t.clone();
        }
        if event.is_error() {
            diag.last_asr_error = truncate(raw, ERROR_MAX);
        }
        diag.level
    };

    let transcript = event.transcript().to_string();
    if transcript.is_empty() {
        ctx.diag.lock().unwrap().no_transcript_count += 1;
        return;
    }

    let mut commit = ctx.commit.lock().unwrap();
    if event.is_commit() {
        let emit = commit.offer_final(&transcript, now);
        drop(commit);
        {
            let mut diag = ctx.diag.lock().unwrap();
            diag.final_text = transcript.clone();
            diag.partial.clear();
        }
        if emit {
            ctx.emit_text(&transcript);
        }
    } else {
        let emit = commit.offer_partial(&transcript, level, now);
        drop(commit);
        ctx.diag.lock().unwrap().partial = transcript.clone();
        if emit {
            ctx.emit_text(&transcript);
        }
    }
}

async fn pump_status(ctx: &WorkerContext) -> Result<()> {
    loop {
        ctx.push_status();
        sleep(STATUS_INTERVAL).await;
    }
}

/// Serialize worker events onto stdout, one JSON line each. stderr carries
/// logs; stdout is reserved for this protocol.
async fn write_events(mut rx: mpsc::Receiver<WorkerEvent>) {
    let mut out = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        let Ok(mut line) = serde_json::to_string(&event) else {
            continue;
        };
        line.push('\n');
        if out.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = out.flush().await;
    }
}

/// Cooperative stop: the parent writes "stop" to our stdin; EOF means the
/// parent itself is gone, which is treated the same way.
async fn watch_stdin(stop_tx: watch::Sender<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == "stop" => break,
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    let _ = stop_tx.send(true);
}
