// Worker <-> capture link over loopback TCP: handshake, message framing
// and failure signalling.

use dualscribe::ipc::{CaptureMessage, IpcListener, IpcSender, IPC_SECRET};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn test_handshake_and_message_flow() {
    let listener = IpcListener::bind().await.unwrap();
    let port = listener.port().unwrap();

    let client = tokio::spawn(async move {
        let mut sender = IpcSender::connect(port).await.unwrap();
        sender.send(&CaptureMessage::log("capture start")).await.unwrap();
        sender
            .send(&CaptureMessage::pcm(1234, 0.25, &[1, 2, 3, 4]))
            .await
            .unwrap();
        sender
    });

    let mut rx = listener.accept().await.unwrap();

    let first = rx
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    match first {
        CaptureMessage::Log { text } => assert_eq!(text, "capture start"),
        other => panic!("unexpected message: {:?}", other),
    }

    let second = rx
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let (ts_ms, rms, pcm) = second.decode_pcm().unwrap();
    assert_eq!(ts_ms, 1234);
    assert!((rms - 0.25).abs() < f32::EPSILON);
    assert_eq!(pcm, vec![1, 2, 3, 4]);

    // Keep the sender alive until the reads above complete
    drop(client.await.unwrap());
}

#[tokio::test]
async fn test_bad_secret_is_rejected() {
    let listener = IpcListener::bind().await.unwrap();
    let port = listener.port().unwrap();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream.write_all(b"not-the-secret\n").await.unwrap();

    assert!(listener.accept().await.is_err());
}

#[tokio::test]
async fn test_recv_timeout_while_quiet() {
    let listener = IpcListener::bind().await.unwrap();
    let port = listener.port().unwrap();

    let sender = IpcSender::connect(port).await.unwrap();
    let mut rx = listener.accept().await.unwrap();

    // Connected but silent: timeouts are Ok(None), not errors
    let got = rx.recv_timeout(Duration::from_millis(50)).await.unwrap();
    assert!(got.is_none());

    drop(sender);
}

#[tokio::test]
async fn test_closed_connection_is_an_error() {
    let listener = IpcListener::bind().await.unwrap();
    let port = listener.port().unwrap();

    let sender = IpcSender::connect(port).await.unwrap();
    let mut rx = listener.accept().await.unwrap();
    drop(sender);

    assert!(rx.recv_timeout(Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn test_secret_matches_protocol_constant() {
    // The capture child sends this exact line first; a mismatch would
    // break every worker/capture pairing.
    assert_eq!(IPC_SECRET, "dualscribe-capture");
}
