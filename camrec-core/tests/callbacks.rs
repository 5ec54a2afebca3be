mod support;

use std::sync::Arc;

use camrec_core::config::CallbacksSection;
use camrec_core::{CallbackReply, Protocol, PublishCallbacks, RecordingOrchestrator};
use support::{camera, orchestrator, registry_with, FakeSpawner};
use tempfile::TempDir;

struct Fixture {
    callbacks: PublishCallbacks,
    orchestrator: Arc<RecordingOrchestrator>,
    spawner: Arc<FakeSpawner>,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let (orchestrator, spawner) = orchestrator(dir.path());
    let orchestrator = Arc::new(orchestrator);
    let mut disabled = camera("cam-2", "cam2", Protocol::Rtmp, None);
    disabled.active = false;
    let mut transcoded = camera("cam-1", "cam1", Protocol::Rtmp, None);
    transcoded.transcode = true;
    let registry = Arc::new(registry_with(&[transcoded, disabled]));
    let callbacks = PublishCallbacks::new(
        Arc::clone(&orchestrator),
        registry,
        &CallbacksSection::default(),
    );
    Fixture {
        callbacks,
        orchestrator,
        spawner,
        _dir: dir,
    }
}

fn payload(action: &str, stream: &str) -> String {
    serde_json::json!({
        "action": action,
        "client_id": 42,
        "ip": "203.0.113.7",
        "vhost": "__defaultVhost__",
        "app": "live",
        "stream": stream,
    })
    .to_string()
}

#[tokio::test]
async fn publish_starts_recording_from_the_stream_server() {
    let fx = fixture();

    let reply = fx.callbacks.dispatch(&payload("on_publish", "acme/cam1")).await;

    assert_eq!(reply, CallbackReply::allow());
    let status = fx.orchestrator.camera_status("cam-1").await.unwrap();
    assert!(status.transcode);
    assert_eq!(status.protocol, Protocol::Rtmp);
    let command = fx.spawner.latest().command;
    assert!(command
        .args
        .iter()
        .any(|arg| arg == "rtmp://srs:1935/live/acme/cam1"));
}

#[tokio::test]
async fn unpublish_stops_recording() {
    let fx = fixture();
    fx.callbacks.dispatch(&payload("on_publish", "acme/cam1")).await;

    let reply = fx
        .callbacks
        .dispatch(&payload("on_unpublish", "acme/cam1"))
        .await;

    assert!(reply.allowed());
    assert!(fx.orchestrator.camera_status("cam-1").await.is_none());
    assert!(fx.spawner.latest().has_exited());
}

#[tokio::test]
async fn unknown_streams_are_rejected() {
    let fx = fixture();
    let cases = [
        ("acme", "Invalid stream path"),
        ("nobody/cam1", "Client not found"),
        ("acme/ghost", "Camera not found"),
        ("acme/cam2", "Camera inactive"),
    ];
    for (stream, message) in cases {
        let reply = fx.callbacks.dispatch(&payload("on_publish", stream)).await;
        assert_eq!(reply, CallbackReply::reject(message), "stream {stream}");
    }
    assert_eq!(fx.spawner.spawn_count(), 0);
}

#[tokio::test]
async fn recorder_failure_still_allows_the_stream() {
    let fx = fixture();
    fx.spawner.fail_next();

    let reply = fx.callbacks.dispatch(&payload("on_publish", "acme/cam1")).await;

    assert!(reply.allowed());
    assert!(fx.orchestrator.camera_status("cam-1").await.is_none());
}

#[tokio::test]
async fn connect_and_garbage_are_allowed() {
    let fx = fixture();
    assert!(fx
        .callbacks
        .dispatch(&payload("on_connect", "acme/cam1"))
        .await
        .allowed());
    assert!(fx.callbacks.dispatch("not json").await.allowed());
    assert!(fx
        .callbacks
        .dispatch(&payload("on_unpublish", "nobody/cam9"))
        .await
        .allowed());
    assert_eq!(fx.spawner.spawn_count(), 0);
}
