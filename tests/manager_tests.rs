// Dual-pipeline manager surface: credential gate, idempotent stop and the
// always-complete status shape.

use dualscribe::{DualPipelineManager, Settings};
use std::sync::Arc;

const KEY_ENV: &str = "DEEPGRAM_API_KEY";

fn noop_callback() -> Arc<dyn Fn(&str, &str) + Send + Sync> {
    Arc::new(|_speaker, _text| {})
}

// Environment mutation is process-global, so everything that touches the
// key variable lives in this one test.
#[tokio::test]
async fn test_manager_lifecycle() {
    let saved = std::env::var(KEY_ENV).ok();

    // Without a credential, construction fails before anything starts
    std::env::remove_var(KEY_ENV);
    assert!(DualPipelineManager::new(Settings::default(), noop_callback()).is_err());

    std::env::set_var(KEY_ENV, "   ");
    assert!(DualPipelineManager::new(Settings::default(), noop_callback()).is_err());

    std::env::set_var(KEY_ENV, "test-key");
    let manager = DualPipelineManager::new(Settings::default(), noop_callback()).unwrap();

    // Stop before start is a no-op, and stop is idempotent
    manager.stop().await;
    manager.stop().await;

    // Both streams always report a complete baseline shape
    let status = manager.status().await;
    assert_eq!(status.len(), 2);
    let mic = status.get("mic").unwrap();
    let system = status.get("system").unwrap();
    assert!(!mic.status.should_be_active());
    assert!(!system.status.should_be_active());
    assert!(!mic.worker_alive);
    assert_eq!(mic.worker_exit, None);
    assert_eq!(mic.queue_size, 0);

    match saved {
        Some(value) => std::env::set_var(KEY_ENV, value),
        None => std::env::remove_var(KEY_ENV),
    }
}
