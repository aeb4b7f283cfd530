//! Parent-side stream supervision.
//!
//! A `StreamSupervisor` owns one worker process end to end: it spawns it,
//! drains its status/transcript output into shared state, and watches for
//! freezes (audio flowing in, nothing flowing out) that only a hard
//! restart can fix. The parent never blocks on the worker and only ever
//! observes state, never errors, across the process boundary.

mod freeze;

pub use freeze::{freeze_reason, FreezeDetector};

use anyhow::{Context, Result};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::{Settings, StreamConfig};
use crate::worker::{StatusSnapshot, WorkerEvent};

/// Transcript sink shared by both streams: `on_text(speaker, text)`,
/// invoked at most once per committed transcript.
pub type TextCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Builds the command used to launch a worker process. Swappable so a
/// scripted stand-in can replace the real subcommand in tests.
pub type WorkerLauncher = Arc<dyn Fn(&StreamConfig) -> Result<Command> + Send + Sync>;

/// How often the pump loop drains worker output.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);
/// How often the monitor loop evaluates freeze conditions.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period for a cooperative worker exit before the hard kill.
const STOP_GRACE: Duration = Duration::from_secs(1);

struct WorkerHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Per-start() state, torn down wholesale by stop().
struct Running {
    stop_tx: watch::Sender<bool>,
    status_tx: mpsc::Sender<StatusSnapshot>,
    text_tx: mpsc::Sender<(String, String)>,
    worker: Option<WorkerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: StreamConfig,
    settings: Settings,
    on_text: TextCallback,
    launcher: WorkerLauncher,
    /// Latest merged snapshot, readable at any time
    latest: Mutex<StatusSnapshot>,
    running: tokio::sync::Mutex<Option<Running>>,
}

pub struct StreamSupervisor {
    inner: Arc<Inner>,
}

impl StreamSupervisor {
    pub fn new(config: StreamConfig, settings: Settings, on_text: TextCallback) -> Self {
        Self::with_launcher(config, settings, on_text, Arc::new(default_launcher))
    }

    /// Like `new`, but with a custom worker launcher.
    pub fn with_launcher(
        config: StreamConfig,
        settings: Settings,
        on_text: TextCallback,
        launcher: WorkerLauncher,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                settings,
                on_text,
                launcher,
                latest: Mutex::new(StatusSnapshot::default()),
                running: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    /// Latest known status for this stream.
    pub fn latest(&self) -> StatusSnapshot {
        self.inner.latest.lock().unwrap().clone()
    }

    /// Spawn the worker process and the pump/monitor loops. Always resets
    /// any previous run first.
    pub async fn start(&self) -> Result<()> {
        self.stop().await;

        info!("starting stream supervisor: {}", self.inner.config.label);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = mpsc::channel(self.inner.settings.buffers.status_queue);
        let (text_tx, text_rx) = mpsc::channel(self.inner.settings.buffers.text_queue);

        let mut running = Running {
            stop_tx,
            status_tx,
            text_tx,
            worker: None,
            tasks: Vec::new(),
        };

        spawn_worker(&self.inner, &mut running)?;

        let pump = tokio::spawn(pump_loop(
            Arc::clone(&self.inner),
            stop_rx.clone(),
            status_rx,
            text_rx,
        ));
        let monitor = tokio::spawn(monitor_loop(Arc::clone(&self.inner), stop_rx));
        running.tasks.push(pump);
        running.tasks.push(monitor);

        *self.inner.running.lock().await = Some(running);
        Ok(())
    }

    /// Two-phase stop: cooperative stop line on the worker's stdin, hard
    /// kill if it lingers. Safe to call at any time, any number of times;
    /// status always ends at the stopped baseline.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().await.take();

        if let Some(mut running) = running {
            info!("stopping stream supervisor: {}", self.inner.config.label);
            let _ = running.stop_tx.send(true);

            if let Some(mut handle) = running.worker.take() {
                if let Some(mut stdin) = handle.stdin.take() {
                    let _ = stdin.write_all(b"stop\n").await;
                    let _ = stdin.flush().await;
                    drop(stdin);
                }
                match timeout(STOP_GRACE, handle.child.wait()).await {
                    Ok(Ok(_)) => {}
                    _ => {
                        let _ = handle.child.start_kill();
                        let _ = handle.child.wait().await;
                    }
                }
            }

            for task in running.tasks {
                task.abort();
            }
        }

        *self.inner.latest.lock().unwrap() = StatusSnapshot::default();
    }
}

fn default_launcher(config: &StreamConfig) -> Result<Command> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let spec = serde_json::to_string(config).context("failed to encode stream config")?;

    let mut cmd = Command::new(exe);
    cmd.arg("stream-worker").arg("--spec").arg(spec);
    Ok(cmd)
}

fn spawn_worker(inner: &Arc<Inner>, running: &mut Running) -> Result<()> {
    let mut child = (inner.launcher)(&inner.config)?
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn stream worker")?;

    let stdout = child.stdout.take().context("worker stdout unavailable")?;
    let stdin = child.stdin.take().context("worker stdin unavailable")?;
    let pid = child.id();

    let reader = tokio::spawn(read_worker_output(
        stdout,
        running.status_tx.clone(),
        running.text_tx.clone(),
    ));
    running.tasks.push(reader);
    running.worker = Some(WorkerHandle {
        child,
        stdin: Some(stdin),
    });

    let mut latest = inner.latest.lock().unwrap();
    latest.worker_pid = pid;
    latest.worker_alive = true;
    latest.worker_exit = None;

    Ok(())
}

/// Parse the worker's stdout lines into bounded channels. A full channel
/// drops the entry; the worker is never backpressured by a slow parent.
async fn read_worker_output(
    stdout: ChildStdout,
    status_tx: mpsc::Sender<StatusSnapshot>,
    text_tx: mpsc::Sender<(String, String)>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<WorkerEvent>(&line) {
            Ok(WorkerEvent::Status { snapshot }) => {
                let _ = status_tx.try_send(snapshot);
            }
            Ok(WorkerEvent::Transcript { speaker, text, .. }) => {
                let _ = text_tx.try_send((speaker, text));
            }
            Err(_) => {} // stray output, not protocol
        }
    }
}

/// Drain status and transcript channels into shared state on a short
/// fixed interval.
async fn pump_loop(
    inner: Arc<Inner>,
    stop_rx: watch::Receiver<bool>,
    mut status_rx: mpsc::Receiver<StatusSnapshot>,
    mut text_rx: mpsc::Receiver<(String, String)>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        while let Ok(snapshot) = status_rx.try_recv() {
            merge_snapshot(&inner, snapshot);
        }

        while let Ok((speaker, text)) = text_rx.try_recv() {
            (inner.on_text)(&speaker, &text);
        }

        sleep(PUMP_INTERVAL).await;
    }
}

/// Replace the shared snapshot with the worker's, preserving the fields
/// only the parent knows (pid/liveness/exit).
fn merge_snapshot(inner: &Inner, mut snapshot: StatusSnapshot) {
    let mut latest = inner.latest.lock().unwrap();
    snapshot.worker_pid = latest.worker_pid;
    snapshot.worker_alive = latest.worker_alive;
    snapshot.worker_exit = latest.worker_exit;
    *latest = snapshot;
}

/// Reconcile the parent-side liveness fields with the actual child state.
/// Without this, a worker that dies on its own would keep reporting
/// itself alive forever: the output reader just ends on EOF.
fn refresh_worker_liveness(latest: &Mutex<StatusSnapshot>, child: &mut Child) {
    if let Ok(Some(status)) = child.try_wait() {
        let mut latest = latest.lock().unwrap();
        latest.worker_alive = false;
        latest.worker_exit = status.code();
    }
}

/// Evaluate freeze conditions periodically; on detection, hard-restart
/// the worker with pauses on either side to prevent restart storms.
async fn monitor_loop(inner: Arc<Inner>, stop_rx: watch::Receiver<bool>) {
    let mut detector = FreezeDetector::new(inner.settings.freeze.clone());

    loop {
        sleep(MONITOR_INTERVAL).await;
        if *stop_rx.borrow() {
            break;
        }

        {
            let mut guard = inner.running.lock().await;
            if let Some(handle) = guard.as_mut().and_then(|r| r.worker.as_mut()) {
                refresh_worker_liveness(&inner.latest, &mut handle.child);
            }
        }

        let snap = inner.latest.lock().unwrap().clone();
        if let Some(reason) = detector.check(&snap, Instant::now()) {
            warn!("{}: {}", inner.config.label, reason);
            inner.latest.lock().unwrap().last_ws_close = reason;
            restart_worker(&inner).await;
        }
    }
}

async fn restart_worker(inner: &Arc<Inner>) {
    let mut guard = inner.running.lock().await;
    let Some(running) = guard.as_mut() else {
        return;
    };

    if let Some(mut handle) = running.worker.take() {
        let _ = handle.child.start_kill();
        let exit = handle.child.wait().await.ok();
        let mut latest = inner.latest.lock().unwrap();
        latest.worker_alive = false;
        latest.worker_exit = exit.and_then(|s| s.code());
    }

    sleep(Duration::from_millis(inner.settings.freeze.restart_pause_ms)).await;

    if let Err(e) = spawn_worker(inner, running) {
        warn!(
            "failed to respawn worker for {}: {:#}",
            inner.config.label, e
        );
    }

    sleep(Duration::from_millis(inner.settings.freeze.resume_pause_ms)).await;
}
