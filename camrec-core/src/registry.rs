//! Read-only view of the tenant/camera registry.
//!
//! The registry is owned by another service; recording only ever looks
//! records up. [`SqliteRegistry`] reads the shared database file and
//! [`MemoryRegistry`] backs tests and embedded callers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sqlite::configure_connection;

pub const REGISTRY_SCHEMA: &str = include_str!("../../sql/registry.sql");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to open registry at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("registry path not configured")]
    MissingPath,
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Rtsp,
    Rtmp,
    Hls,
}

impl Protocol {
    /// Pull protocols are fetched from the camera's own endpoint; everything
    /// else is pushed into the media server by the camera.
    pub fn is_pull(self) -> bool {
        matches!(self, Protocol::Rtsp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Rtsp => "RTSP",
            Protocol::Rtmp => "RTMP",
            Protocol::Hls => "HLS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RTSP" => Ok(Protocol::Rtsp),
            "RTMP" => Ok(Protocol::Rtmp),
            "HLS" => Ok(Protocol::Hls),
            other => Err(RegistryError::UnknownProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: String,
    pub client_id: String,
    pub client_slug: String,
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: Option<String>,
    pub active: bool,
    pub transcode: bool,
}

pub trait CameraRegistry: Send + Sync {
    fn camera(&self, camera_id: &str) -> RegistryResult<Option<CameraRecord>>;

    fn client_by_slug(&self, slug: &str) -> RegistryResult<Option<ClientRecord>>;

    fn camera_by_name(&self, client_id: &str, name: &str) -> RegistryResult<Option<CameraRecord>>;

    /// Every camera of every client, ordered by client slug then name.
    fn cameras(&self) -> RegistryResult<Vec<CameraRecord>>;

    fn active_cameras(&self) -> RegistryResult<Vec<CameraRecord>> {
        Ok(self
            .cameras()?
            .into_iter()
            .filter(|camera| camera.active)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteRegistryBuilder {
    path: Option<PathBuf>,
    read_only: bool,
}

impl Default for SqliteRegistryBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: true,
        }
    }
}

impl SqliteRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Opening read-write is only useful for seeding fixtures.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn build(self) -> RegistryResult<SqliteRegistry> {
        let path = self.path.ok_or(RegistryError::MissingPath)?;
        let flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        Ok(SqliteRegistry {
            path,
            flags,
            read_only: self.read_only,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteRegistry {
    path: PathBuf,
    flags: OpenFlags,
    read_only: bool,
}

const CAMERA_COLUMNS: &str = "c.id, c.client_id, cl.slug, c.name, c.protocol, c.endpoint, \
                              c.is_active, c.transcode_to_h265";

impl SqliteRegistry {
    pub fn builder() -> SqliteRegistryBuilder {
        SqliteRegistryBuilder::new()
    }

    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        SqliteRegistryBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> RegistryResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            RegistryError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn, self.read_only).map_err(|source| {
            RegistryError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> RegistryResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(REGISTRY_SCHEMA)?;
        Ok(())
    }

    /// Cheap connectivity probe used by health checks.
    pub fn ping(&self) -> RegistryResult<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cameras", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    fn query_cameras(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> RegistryResult<Vec<CameraRecord>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {CAMERA_COLUMNS} FROM cameras c JOIN clients cl ON cl.id = c.client_id \
             {filter} ORDER BY cl.slug, c.name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, map_camera_row)?;
        let mut cameras = Vec::new();
        for row in rows {
            cameras.push(row??);
        }
        Ok(cameras)
    }
}

fn map_camera_row(row: &Row<'_>) -> rusqlite::Result<RegistryResult<CameraRecord>> {
    let protocol: String = row.get(4)?;
    let protocol = match protocol.parse::<Protocol>() {
        Ok(protocol) => protocol,
        Err(err) => return Ok(Err(err)),
    };
    Ok(Ok(CameraRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        client_slug: row.get(2)?,
        name: row.get(3)?,
        protocol,
        endpoint: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
        transcode: row.get::<_, i64>(7)? != 0,
    }))
}

impl CameraRegistry for SqliteRegistry {
    fn camera(&self, camera_id: &str) -> RegistryResult<Option<CameraRecord>> {
        Ok(self
            .query_cameras("WHERE c.id = ?1", params![camera_id])?
            .into_iter()
            .next())
    }

    fn client_by_slug(&self, slug: &str) -> RegistryResult<Option<ClientRecord>> {
        let conn = self.connect()?;
        let client = conn
            .query_row(
                "SELECT id, slug FROM clients WHERE slug = ?1",
                params![slug],
                |row| {
                    Ok(ClientRecord {
                        id: row.get(0)?,
                        slug: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(client)
    }

    fn camera_by_name(&self, client_id: &str, name: &str) -> RegistryResult<Option<CameraRecord>> {
        Ok(self
            .query_cameras(
                "WHERE c.client_id = ?1 AND c.name = ?2",
                params![client_id, name],
            )?
            .into_iter()
            .next())
    }

    fn cameras(&self) -> RegistryResult<Vec<CameraRecord>> {
        self.query_cameras("", params![])
    }

    fn active_cameras(&self) -> RegistryResult<Vec<CameraRecord>> {
        self.query_cameras("WHERE c.is_active = 1", params![])
    }
}

/// In-process registry. Cameras keep their insertion order.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    clients: RwLock<Vec<ClientRecord>>,
    cameras: RwLock<Vec<CameraRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_client(&self, client: ClientRecord) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.retain(|existing| existing.id != client.id);
        clients.push(client);
    }

    pub fn upsert_camera(&self, camera: CameraRecord) {
        let mut cameras = self.cameras.write().unwrap_or_else(|e| e.into_inner());
        match cameras.iter_mut().find(|existing| existing.id == camera.id) {
            Some(existing) => *existing = camera,
            None => cameras.push(camera),
        }
    }

    pub fn remove_camera(&self, camera_id: &str) -> Option<CameraRecord> {
        let mut cameras = self.cameras.write().unwrap_or_else(|e| e.into_inner());
        let index = cameras.iter().position(|camera| camera.id == camera_id)?;
        Some(cameras.remove(index))
    }
}

impl CameraRegistry for MemoryRegistry {
    fn camera(&self, camera_id: &str) -> RegistryResult<Option<CameraRecord>> {
        let cameras = self.cameras.read().unwrap_or_else(|e| e.into_inner());
        Ok(cameras.iter().find(|camera| camera.id == camera_id).cloned())
    }

    fn client_by_slug(&self, slug: &str) -> RegistryResult<Option<ClientRecord>> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        Ok(clients.iter().find(|client| client.slug == slug).cloned())
    }

    fn camera_by_name(&self, client_id: &str, name: &str) -> RegistryResult<Option<CameraRecord>> {
        let cameras = self.cameras.read().unwrap_or_else(|e| e.into_inner());
        Ok(cameras
            .iter()
            .find(|camera| camera.client_id == client_id && camera.name == name)
            .cloned())
    }

    fn cameras(&self) -> RegistryResult<Vec<CameraRecord>> {
        let cameras = self.cameras.read().unwrap_or_else(|e| e.into_inner());
        Ok(cameras.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parsing_is_case_insensitive() {
        assert_eq!("rtsp".parse::<Protocol>().unwrap(), Protocol::Rtsp);
        assert_eq!(" HLS ".parse::<Protocol>().unwrap(), Protocol::Hls);
        assert!("srt".parse::<Protocol>().is_err());
        assert!(Protocol::Rtsp.is_pull());
        assert!(!Protocol::Rtmp.is_pull());
    }

    #[test]
    fn memory_registry_filters_inactive_cameras() {
        let registry = MemoryRegistry::new();
        registry.insert_client(ClientRecord {
            id: "c1".into(),
            slug: "acme".into(),
        });
        for (id, active) in [("a", true), ("b", false)] {
            registry.upsert_camera(CameraRecord {
                id: id.into(),
                client_id: "c1".into(),
                client_slug: "acme".into(),
                name: format!("cam-{id}"),
                protocol: Protocol::Rtmp,
                endpoint: None,
                active,
                transcode: false,
            });
        }
        let active = registry.active_cameras().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
        assert!(registry.camera_by_name("c1", "cam-b").unwrap().is_some());
        assert!(registry.remove_camera("b").is_some());
        assert_eq!(registry.cameras().unwrap().len(), 1);
    }
}
