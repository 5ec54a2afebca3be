mod support;

use camrec_core::recorder::{JobStatus, ProcessSignal, StartOutcome, StopOutcome};
use camrec_core::{Protocol, RecordingSource, StartRequest, SupervisorError};
use support::harness;
use tempfile::TempDir;

fn request(camera_id: &str, transcode: bool) -> StartRequest {
    StartRequest {
        camera_id: camera_id.into(),
        client_slug: "acme".into(),
        camera_name: "cam1".into(),
        source: RecordingSource {
            url: "rtsp://10.0.0.5:554/stream1".into(),
            protocol: Protocol::Rtsp,
            transcode,
            publish_target: None,
        },
    }
}

#[tokio::test]
async fn start_is_idempotent_per_camera() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());

    let first = h.supervisor.start(request("cam-1", false)).await.unwrap();
    let second = h.supervisor.start(request("cam-1", false)).await.unwrap();

    assert!(matches!(first, StartOutcome::Started { .. }));
    assert_eq!(second, StartOutcome::AlreadyRunning { pid: first.pid() });
    assert_eq!(h.spawner.spawn_count(), 1);
    assert!(dir.path().join("live/acme/cam1_h264").is_dir());

    let status = h.supervisor.status("cam-1").await.unwrap();
    assert_eq!(status.status, JobStatus::Running);
    assert_eq!(status.pid, Some(first.pid()));
    assert_eq!(status.error_count, 0);
    assert_eq!(status.cpu_percent, Some(12.5));
    assert_eq!(status.memory_mb, Some(64.0));
}

#[tokio::test]
async fn concurrent_starts_spawn_once() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());

    let (a, b) = tokio::join!(
        h.supervisor.start(request("cam-1", false)),
        h.supervisor.start(request("cam-1", false))
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(h.spawner.spawn_count(), 1);
    let started = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, StartOutcome::Started { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(outcomes[0].pid(), outcomes[1].pid());
}

#[tokio::test]
async fn stopping_untracked_camera_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    assert_eq!(
        h.supervisor.stop("missing").await.unwrap(),
        StopOutcome::NotTracked
    );
    assert!(h.supervisor.status("missing").await.is_none());
}

#[tokio::test]
async fn stop_sends_sigterm_and_forgets_the_job() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.supervisor.start(request("cam-1", false)).await.unwrap();

    let outcome = h.supervisor.stop("cam-1").await.unwrap();

    assert_eq!(outcome, StopOutcome::Terminated);
    assert_eq!(h.spawner.latest().signals(), vec![ProcessSignal::Terminate]);
    assert!(h.supervisor.status("cam-1").await.is_none());
    assert!(h.supervisor.tracked_cameras().is_empty());
    assert_eq!(
        h.supervisor.stop("cam-1").await.unwrap(),
        StopOutcome::NotTracked
    );
}

#[tokio::test(start_paused = true)]
async fn stubborn_recorder_is_killed_after_grace() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.spawner.ignore_terminate();
    h.supervisor.start(request("cam-1", false)).await.unwrap();

    let outcome = h.supervisor.stop("cam-1").await.unwrap();

    assert_eq!(outcome, StopOutcome::Killed);
    assert_eq!(
        h.spawner.latest().signals(),
        vec![ProcessSignal::Terminate, ProcessSignal::Kill]
    );
    assert!(h.supervisor.tracked_cameras().is_empty());
}

#[tokio::test]
async fn already_exited_recorder_stops_without_signals() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.supervisor.start(request("cam-1", false)).await.unwrap();
    h.spawner.latest().exit_with(0);

    assert_eq!(h.supervisor.stop("cam-1").await.unwrap(), StopOutcome::Exited);
    assert!(h.spawner.latest().signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn crashing_recorder_is_restarted_twice_then_dropped() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.supervisor.start(request("cam-1", true)).await.unwrap();

    h.spawner.latest().exit_with(1);
    h.supervisor.run_monitor_pass().await;
    let status = h.supervisor.status("cam-1").await.unwrap();
    assert_eq!(status.status, JobStatus::Running);
    assert_eq!(status.error_count, 1);
    assert_eq!(
        status.last_error.as_deref(),
        Some("recorder exited with exit code 1: Connection refused")
    );
    assert_eq!(h.spawner.spawn_count(), 2);

    h.spawner.latest().exit_with(1);
    h.supervisor.run_monitor_pass().await;
    assert_eq!(h.supervisor.status("cam-1").await.unwrap().error_count, 2);
    assert_eq!(h.spawner.spawn_count(), 3);

    h.spawner.latest().exit_with(1);
    h.supervisor.run_monitor_pass().await;
    assert!(h.supervisor.status("cam-1").await.is_none());
    assert_eq!(h.spawner.spawn_count(), 3);

    let spawned = h.spawner.spawned();
    assert!(spawned
        .windows(2)
        .all(|pair| pair[0].command == pair[1].command));
    assert!(spawned[0]
        .command
        .args
        .iter()
        .any(|arg| arg.ends_with("live/acme/cam1_h265/%Y-%m-%d_%H-%M-%S.mp4")));
}

#[tokio::test(start_paused = true)]
async fn restart_recreates_a_missing_output_dir() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.supervisor.start(request("cam-1", false)).await.unwrap();
    let output = dir.path().join("live/acme/cam1_h264");
    std::fs::remove_dir_all(&output).unwrap();

    h.spawner.latest().exit_with(1);
    h.supervisor.run_monitor_pass().await;

    assert_eq!(h.spawner.spawn_count(), 2);
    assert!(output.is_dir());
    let status = h.supervisor.status("cam-1").await.unwrap();
    assert_eq!(status.status, JobStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn background_monitor_restarts_crashed_recorder() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.supervisor.spawn_monitor();
    h.supervisor.start(request("cam-1", false)).await.unwrap();
    let settings = h.supervisor.settings().clone();

    h.spawner.latest().exit_with(1);
    tokio::time::sleep(settings.monitor_interval / 2).await;
    assert_eq!(h.spawner.spawn_count(), 1);

    tokio::time::sleep(settings.monitor_interval + settings.restart_delay).await;
    assert_eq!(h.spawner.spawn_count(), 2);
    let status = h.supervisor.status("cam-1").await.unwrap();
    assert_eq!(status.status, JobStatus::Running);
    assert_eq!(status.error_count, 1);

    h.supervisor.shutdown().await;
    assert!(!h.supervisor.monitor_running());
    assert!(h.supervisor.tracked_cameras().is_empty());
}

#[tokio::test]
async fn clean_exit_is_not_restarted() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.supervisor.start(request("cam-1", false)).await.unwrap();
    h.spawner.latest().exit_with(0);

    h.supervisor.run_monitor_pass().await;

    assert_eq!(h.spawner.spawn_count(), 1);
    assert!(h.supervisor.status("cam-1").await.is_none());
}

#[tokio::test]
async fn start_replaces_an_exited_job() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    let first = h.supervisor.start(request("cam-1", false)).await.unwrap();
    h.spawner.latest().exit_with(1);

    let second = h.supervisor.start(request("cam-1", false)).await.unwrap();

    assert!(matches!(second, StartOutcome::Started { .. }));
    assert_ne!(first.pid(), second.pid());
    assert_eq!(h.supervisor.status("cam-1").await.unwrap().error_count, 0);
}

#[tokio::test]
async fn launch_failure_leaves_nothing_tracked() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.spawner.fail_next();

    let err = h.supervisor.start(request("cam-1", false)).await.unwrap_err();

    assert!(matches!(err, SupervisorError::Launch { ref camera_id, .. } if camera_id == "cam-1"));
    assert!(h.supervisor.tracked_cameras().is_empty());
    assert!(h.supervisor.status("cam-1").await.is_none());
}

#[tokio::test]
async fn vanished_pid_is_reported_as_crashed() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    let outcome = h.supervisor.start(request("cam-1", false)).await.unwrap();
    h.probe.mark_dead(outcome.pid());

    let status = h.supervisor.status("cam-1").await.unwrap();

    assert_eq!(status.status, JobStatus::Crashed);
    assert_eq!(status.last_error.as_deref(), Some("process not found"));
    assert!(status.cpu_percent.is_none());
}

#[tokio::test]
async fn status_all_is_sorted_by_camera() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    for id in ["cam-b", "cam-a"] {
        let mut req = request(id, false);
        req.camera_name = id.into();
        h.supervisor.start(req).await.unwrap();
    }

    let ids: Vec<String> = h
        .supervisor
        .status_all()
        .await
        .into_iter()
        .map(|snapshot| snapshot.camera_id)
        .collect();
    assert_eq!(ids, vec!["cam-a".to_string(), "cam-b".to_string()]);
}

#[tokio::test]
async fn shutdown_stops_jobs_and_monitor() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path());
    h.supervisor.spawn_monitor();
    h.supervisor.spawn_monitor();
    assert!(h.supervisor.monitor_running());
    h.supervisor.start(request("cam-1", false)).await.unwrap();

    h.supervisor.shutdown().await;

    assert!(!h.supervisor.monitor_running());
    assert!(h.supervisor.tracked_cameras().is_empty());
    assert!(h.spawner.latest().has_exited());
    assert_eq!(
        h.spawner.events(),
        vec!["spawn:1000".to_string(), "signal:1000:Terminate".to_string()]
    );
}
