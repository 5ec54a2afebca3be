use std::path::Path;

use camrec_core::{CameraRegistry, Protocol, RegistryError, SqliteRegistry};
use rusqlite::{params, Connection};
use tempfile::TempDir;

fn seeded_registry(dir: &Path) -> SqliteRegistry {
    let path = dir.join("registry.sqlite");
    let writable = SqliteRegistry::builder()
        .path(&path)
        .read_only(false)
        .build()
        .expect("create registry");
    writable.initialize().expect("apply schema");

    let conn = Connection::open(&path).unwrap();
    conn.execute(
        "INSERT INTO clients (id, slug, name) VALUES (?1, ?2, ?3)",
        params!["c-1", "acme", "Acme"],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO clients (id, slug, name) VALUES (?1, ?2, ?3)",
        params!["c-2", "beta", "Beta"],
    )
    .unwrap();
    let cameras = [
        ("cam-1", "c-1", "lobby", "RTSP", Some("rtsp://10.0.0.5/ch1"), 1, 0),
        ("cam-2", "c-1", "dock", "RTMP", None, 0, 1),
        ("cam-3", "c-2", "gate", "HLS", None, 1, 1),
    ];
    for (id, client, name, protocol, endpoint, active, transcode) in cameras {
        conn.execute(
            "INSERT INTO cameras (id, client_id, name, protocol, endpoint, is_active, transcode_to_h265) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, client, name, protocol, endpoint, active, transcode],
        )
        .unwrap();
    }
    conn.execute_batch("PRAGMA journal_mode = DELETE;").unwrap();
    drop(conn);

    SqliteRegistry::open(&path).expect("open registry")
}

#[test]
fn cameras_are_joined_with_their_client() {
    let dir = TempDir::new().unwrap();
    let registry = seeded_registry(dir.path());

    let cameras = registry.cameras().unwrap();
    let names: Vec<(&str, &str)> = cameras
        .iter()
        .map(|camera| (camera.client_slug.as_str(), camera.name.as_str()))
        .collect();
    assert_eq!(names, vec![("acme", "dock"), ("acme", "lobby"), ("beta", "gate")]);

    let lobby = registry.camera("cam-1").unwrap().unwrap();
    assert_eq!(lobby.protocol, Protocol::Rtsp);
    assert_eq!(lobby.endpoint.as_deref(), Some("rtsp://10.0.0.5/ch1"));
    assert!(lobby.active);
    assert!(!lobby.transcode);
    assert_eq!(registry.ping().unwrap(), 3);
}

#[test]
fn active_cameras_skip_disabled_ones() {
    let dir = TempDir::new().unwrap();
    let registry = seeded_registry(dir.path());

    let ids: Vec<String> = registry
        .active_cameras()
        .unwrap()
        .into_iter()
        .map(|camera| camera.id)
        .collect();
    assert_eq!(ids, vec!["cam-1".to_string(), "cam-3".to_string()]);
}

#[test]
fn lookups_by_slug_and_name() {
    let dir = TempDir::new().unwrap();
    let registry = seeded_registry(dir.path());

    let client = registry.client_by_slug("acme").unwrap().unwrap();
    assert_eq!(client.id, "c-1");
    assert!(registry.client_by_slug("nobody").unwrap().is_none());

    let dock = registry.camera_by_name(&client.id, "dock").unwrap().unwrap();
    assert_eq!(dock.id, "cam-2");
    assert!(dock.transcode);
    assert!(registry.camera_by_name("c-2", "dock").unwrap().is_none());
    assert!(registry.camera("cam-404").unwrap().is_none());
}

#[test]
fn missing_database_fails_to_open() {
    let dir = TempDir::new().unwrap();
    let registry = SqliteRegistry::open(dir.path().join("absent.sqlite")).unwrap();
    let err = registry.cameras().unwrap_err();
    assert!(matches!(err, RegistryError::OpenDatabase { .. }));
}
