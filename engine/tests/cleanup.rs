use std::time::Duration;

use sync_engine::{Config, SyncEngine};

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        poll_min: Duration::from_millis(30),
        poll_max: Duration::from_millis(200),
        delivery_ttl: Duration::from_millis(150),
        cleanup_every: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test]
async fn delivery_entries_swept_even_after_leaving() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = SyncEngine::new(test_config(tmp.path()), None).await.unwrap();
    let (room, _rx) = engine.create_room("ana", "¿algo?", 50).await.unwrap();
    let msg = engine.send_message(&room.code, "hola", false).await.unwrap();
    assert!(engine.delivery_state(msg.id).is_some());

    engine.leave_room(&room.code).await.unwrap();
    assert!(engine.cleanup_running());

    // one ttl plus one sweep period later the entry must be gone
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(engine.delivery_state(msg.id).is_none());
}

#[tokio::test]
async fn shutdown_stops_the_sweep_task() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = SyncEngine::new(test_config(tmp.path()), None).await.unwrap();
    assert!(engine.cleanup_running());
    engine.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!engine.cleanup_running());
}
