// Parent-side supervision against scripted stand-in workers: liveness
// reporting for a worker that dies on its own, and failure isolation
// between two streams.

use chrono::Utc;
use dualscribe::{
    Settings, StatusSnapshot, StreamConfig, StreamStatus, StreamSupervisor, TextCallback,
    WorkerEvent, WorkerLauncher,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};

fn noop_callback() -> TextCallback {
    Arc::new(|_speaker, _text| {})
}

/// Launcher whose "worker" exits immediately with the given code.
fn exiting_launcher(code: i32) -> WorkerLauncher {
    Arc::new(move |_config: &StreamConfig| {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("exit {}", code));
        Ok(cmd)
    })
}

/// Launcher whose "worker" writes the given protocol lines to stdout and
/// then stays alive.
fn scripted_launcher(lines: Vec<String>) -> WorkerLauncher {
    Arc::new(move |_config: &StreamConfig| {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"printf '%s\n' "$LINE_ONE" "$LINE_TWO"; sleep 30"#)
            .env("LINE_ONE", &lines[0])
            .env("LINE_TWO", &lines[1]);
        Ok(cmd)
    })
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_dead_worker_liveness_is_reported() {
    let supervisor = StreamSupervisor::with_launcher(
        StreamConfig::mic("default"),
        Settings::default(),
        noop_callback(),
        exiting_launcher(7),
    );

    supervisor.start().await.unwrap();
    assert!(supervisor.latest().worker_alive);

    // The worker exits on its own; the monitor notices without any stop
    // or restart being requested.
    let converged = wait_until(|| {
        let snap = supervisor.latest();
        !snap.worker_alive && snap.worker_exit == Some(7)
    })
    .await;
    assert!(converged, "liveness never converged: {:?}", supervisor.latest());

    supervisor.stop().await;
    assert_eq!(supervisor.latest().worker_exit, None);
}

#[tokio::test]
async fn test_streams_fail_independently() {
    // Stream A: a worker that can never come up
    let a = StreamSupervisor::with_launcher(
        StreamConfig::mic("default"),
        Settings::default(),
        noop_callback(),
        exiting_launcher(1),
    );

    // Stream B: a healthy worker reporting streaming and one transcript
    let snapshot = StatusSnapshot {
        status: StreamStatus::Streaming,
        ..StatusSnapshot::default()
    };
    let status_line = serde_json::to_string(&WorkerEvent::Status { snapshot }).unwrap();
    let text_line = serde_json::to_string(&WorkerEvent::Transcript {
        speaker: "B".to_string(),
        text: "hello from b".to_string(),
        timestamp: Utc::now(),
    })
    .unwrap();

    let texts: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&texts);
    let b = StreamSupervisor::with_launcher(
        StreamConfig::system("default"),
        Settings::default(),
        Arc::new(move |speaker: &str, text: &str| {
            sink.lock()
                .unwrap()
                .push((speaker.to_string(), text.to_string()));
        }),
        scripted_launcher(vec![status_line, text_line]),
    );

    a.start().await.unwrap();
    b.start().await.unwrap();

    // B makes progress
    let b_ok = wait_until(|| {
        b.latest().status == StreamStatus::Streaming && !texts.lock().unwrap().is_empty()
    })
    .await;
    assert!(b_ok, "stream B never progressed: {:?}", b.latest());

    // A's worker is observed dead
    let a_dead = wait_until(|| !a.latest().worker_alive).await;
    assert!(a_dead, "stream A still reported alive: {:?}", a.latest());

    // A's failure leaves B untouched
    let b_snap = b.latest();
    assert_eq!(b_snap.status, StreamStatus::Streaming);
    assert!(b_snap.worker_alive);
    assert_eq!(
        texts.lock().unwrap().as_slice(),
        &[("B".to_string(), "hello from b".to_string())]
    );

    a.stop().await;
    b.stop().await;
}
