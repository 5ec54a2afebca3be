//! Keeps the media server's routing table in line with the registry.
//!
//! Two paths share one routing decision ([`PathTarget::for_camera`]): a full
//! rewrite of the config file followed by a reload, and per-camera calls
//! against the live control API.

pub mod api;
pub mod document;
pub mod reload;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MediaServerSection;
use crate::exec::CommandExecutor;
use crate::registry::{CameraRecord, CameraRegistry, RegistryError};

pub use api::{DeleteOutcome, MediaServerApi};
pub use document::{MediaServerDocument, PathConfig};
pub use reload::{ReloadMethod, Reloader};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to render media server config: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("media server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("media server rejected {path} ({status}): {body}")]
    Api {
        path: String,
        status: u16,
        body: String,
    },
    #[error("media server reload failed: {attempts}")]
    ReloadFailed { attempts: String },
    #[error("camera {camera_id} pulls over RTSP but has no endpoint")]
    MissingEndpoint { camera_id: String },
}

/// Replaces everything outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let pattern = UNSAFE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("valid regex"));
    pattern.replace_all(name, "_").into_owned()
}

pub fn publish_path(client_slug: &str, camera_name: &str) -> String {
    format!("live/{client_slug}/{}", sanitize_name(camera_name))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathSource {
    Pull { url: String, on_demand: bool },
    Publisher,
}

/// Desired state of one camera's path on the media server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathTarget {
    pub path: String,
    pub source: PathSource,
    /// Always false: camrec is the only recorder.
    pub record: bool,
}

impl PathTarget {
    pub fn for_camera(camera: &CameraRecord) -> Result<Self, ReconcileError> {
        let source = if camera.protocol.is_pull() {
            let url = camera
                .endpoint
                .as_deref()
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .ok_or_else(|| ReconcileError::MissingEndpoint {
                    camera_id: camera.id.clone(),
                })?;
            PathSource::Pull {
                url: url.to_string(),
                on_demand: true,
            }
        } else {
            PathSource::Publisher
        };
        Ok(Self {
            path: publish_path(&camera.client_slug, &camera.name),
            source,
            record: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Add,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub cameras: usize,
    /// Cameras left out of the document (pull cameras without endpoint).
    pub skipped: Vec<String>,
    pub config_path: PathBuf,
    pub reload: ReloadMethod,
}

pub struct Reconciler {
    api: MediaServerApi,
    config_path: PathBuf,
    reloader: Reloader,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("api", &self.api)
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        config: &MediaServerSection,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Result<Self, ReconcileError> {
        Ok(Self {
            api: MediaServerApi::new(&config.api_url, config.request_timeout())?,
            config_path: config.config_path.clone(),
            reloader: Reloader::new(config, executor),
        })
    }

    /// Regenerates the whole config from every camera of every client and
    /// reloads the server.
    pub async fn full_reconcile(
        &self,
        registry: &dyn CameraRegistry,
    ) -> Result<SyncReport, ReconcileError> {
        let cameras = registry.cameras()?;
        let mut targets = Vec::with_capacity(cameras.len());
        let mut skipped = Vec::new();
        for camera in &cameras {
            match PathTarget::for_camera(camera) {
                Ok(target) => targets.push(target),
                Err(err) => {
                    warn!(camera_id = %camera.id, error = %err, "camera left out of media server config");
                    skipped.push(camera.id.clone());
                }
            }
        }

        let document = MediaServerDocument::with_targets(&targets);
        document.write_atomic(&self.config_path)?;
        info!(
            cameras = targets.len(),
            path = %self.config_path.display(),
            "media server config written"
        );

        let reload = self.reloader.reload().await?;
        Ok(SyncReport {
            cameras: targets.len(),
            skipped,
            config_path: self.config_path.clone(),
            reload,
        })
    }

    pub async fn apply_camera_reconciliation(
        &self,
        camera: &CameraRecord,
        action: ReconcileAction,
    ) -> Result<(), ReconcileError> {
        let target = PathTarget::for_camera(camera)?;
        let config = PathConfig::from(&target);
        match action {
            ReconcileAction::Add => self.api.add_path(&target.path, &config).await,
            ReconcileAction::Update => self.api.patch_path(&target.path, &config).await,
        }
    }

    pub async fn remove_camera_reconciliation(
        &self,
        client_slug: &str,
        camera_name: &str,
    ) -> Result<DeleteOutcome, ReconcileError> {
        self.api
            .delete_path(&publish_path(client_slug, camera_name))
            .await
    }
}
