//! Entry point other subsystems use to drive recording.
//!
//! Mostly a pass-through to [`JobSupervisor`]. Lifecycle changes funnel
//! through [`RecordingOrchestrator::notify`], the one place a job
//! started/stopped event would be published.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::supervisor::{
    JobSnapshot, JobSupervisor, RecordingSource, StartOutcome, StartRequest, StopOutcome,
    SupervisorError,
};
use crate::media_server::publish_path;
use crate::registry::{CameraRecord, CameraRegistry, RegistryError};
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingEvent {
    Started { camera_id: String, pid: u32 },
    Stopped { camera_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraUpdate {
    Unchanged,
    Started,
    Stopped,
    Restarted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub started: Vec<String>,
    pub failed: Vec<String>,
    /// Active cameras with nothing to record from (pull camera without endpoint).
    pub skipped: Vec<String>,
}

#[derive(Debug)]
pub struct RecordingOrchestrator {
    supervisor: JobSupervisor,
    rtsp_base: String,
    restart_delay: Duration,
}

impl RecordingOrchestrator {
    pub fn new(supervisor: JobSupervisor, rtsp_base: impl Into<String>) -> Self {
        let restart_delay = supervisor.settings().restart_delay;
        Self {
            supervisor,
            rtsp_base: rtsp_base.into().trim_end_matches('/').to_string(),
            restart_delay,
        }
    }

    pub fn supervisor(&self) -> &JobSupervisor {
        &self.supervisor
    }

    /// Pull cameras are recorded straight from their endpoint; push cameras
    /// from the media server's re-stream of their publish path.
    pub fn source_for(&self, camera: &CameraRecord) -> Option<RecordingSource> {
        let restream = format!(
            "{}/{}",
            self.rtsp_base,
            publish_path(&camera.client_slug, &camera.name)
        );
        if camera.protocol.is_pull() {
            let endpoint = camera
                .endpoint
                .as_deref()
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())?;
            Some(RecordingSource {
                url: endpoint.to_string(),
                protocol: camera.protocol,
                transcode: camera.transcode,
                publish_target: Some(restream),
            })
        } else {
            Some(RecordingSource {
                url: restream,
                protocol: camera.protocol,
                transcode: camera.transcode,
                publish_target: None,
            })
        }
    }

    pub async fn start_camera_recording(
        &self,
        camera_id: &str,
        client_slug: &str,
        camera_name: &str,
        source: RecordingSource,
    ) -> Result<StartOutcome, SupervisorError> {
        let mode = if source.transcode { "transcode" } else { "copy" };
        info!(camera_id = %camera_id, camera = %camera_name, mode, "starting camera recording");
        let outcome = self
            .supervisor
            .start(StartRequest {
                camera_id: camera_id.to_string(),
                client_slug: client_slug.to_string(),
                camera_name: camera_name.to_string(),
                source,
            })
            .await?;
        if let StartOutcome::Started { pid } = outcome {
            self.notify(RecordingEvent::Started {
                camera_id: camera_id.to_string(),
                pid,
            });
        }
        Ok(outcome)
    }

    pub async fn stop_camera_recording(
        &self,
        camera_id: &str,
    ) -> Result<StopOutcome, SupervisorError> {
        let outcome = self.supervisor.stop(camera_id).await?;
        if outcome != StopOutcome::NotTracked {
            self.notify(RecordingEvent::Stopped {
                camera_id: camera_id.to_string(),
            });
        }
        Ok(outcome)
    }

    /// Stop, pause, start. The old job is gone before the new one launches,
    /// so two recorders never write for the same camera.
    pub async fn restart_camera_recording(
        &self,
        camera_id: &str,
        client_slug: &str,
        camera_name: &str,
        source: RecordingSource,
    ) -> Result<StartOutcome, SupervisorError> {
        info!(camera_id = %camera_id, "restarting camera recording");
        if let Err(err) = self.stop_camera_recording(camera_id).await {
            warn!(camera_id = %camera_id, error = %err, "stop before restart failed");
        }
        sleep(self.restart_delay).await;
        self.start_camera_recording(camera_id, client_slug, camera_name, source)
            .await
    }

    pub async fn camera_status(&self, camera_id: &str) -> Option<JobSnapshot> {
        self.supervisor.status(camera_id).await
    }

    pub async fn all_statuses(&self) -> Vec<JobSnapshot> {
        self.supervisor.status_all().await
    }

    /// Terminates every recorder and the crash monitor.
    pub async fn stop_all(&self) {
        let tracked = self.supervisor.tracked_cameras();
        info!(jobs = tracked.len(), "stopping all recordings");
        self.supervisor.shutdown().await;
        for camera_id in tracked {
            self.notify(RecordingEvent::Stopped { camera_id });
        }
    }

    /// Starts recording a registry camera. Inactive cameras and pull
    /// cameras without an endpoint are left alone.
    pub async fn start_camera(
        &self,
        camera: &CameraRecord,
    ) -> Result<Option<StartOutcome>, SupervisorError> {
        if !camera.active {
            debug!(camera_id = %camera.id, "camera inactive, not recording");
            return Ok(None);
        }
        let Some(source) = self.source_for(camera) else {
            warn!(camera_id = %camera.id, "pull camera has no endpoint, not recording");
            return Ok(None);
        };
        self.start_camera_recording(&camera.id, &camera.client_slug, &camera.name, source)
            .await
            .map(Some)
    }

    /// Reacts to a registry edit. Only activation changes and transcode
    /// toggles touch the running job.
    pub async fn apply_camera_update(
        &self,
        old: &CameraRecord,
        new: &CameraRecord,
    ) -> Result<CameraUpdate, SupervisorError> {
        if !new.active {
            return match self.stop_camera_recording(&new.id).await? {
                StopOutcome::NotTracked => Ok(CameraUpdate::Unchanged),
                _ => Ok(CameraUpdate::Stopped),
            };
        }
        if !old.active {
            return Ok(match self.start_camera(new).await? {
                Some(_) => CameraUpdate::Started,
                None => CameraUpdate::Unchanged,
            });
        }
        if old.transcode == new.transcode {
            return Ok(CameraUpdate::Unchanged);
        }
        let Some(source) = self.source_for(new) else {
            self.stop_camera_recording(&new.id).await?;
            return Ok(CameraUpdate::Stopped);
        };
        self.restart_camera_recording(&new.id, &new.client_slug, &new.name, source)
            .await?;
        Ok(CameraUpdate::Restarted)
    }

    /// Stops a deleted camera and removes its recordings from disk.
    pub async fn remove_camera(&self, camera: &CameraRecord) -> Result<usize, StorageError> {
        if let Err(err) = self.stop_camera_recording(&camera.id).await {
            error!(camera_id = %camera.id, error = %err, "stop on delete failed");
        }
        self.supervisor
            .layout()
            .cleanup_camera(&camera.client_slug, &camera.name)
    }

    /// Rebuilds jobs after a process restart from the registry's active
    /// flag; job state itself is never persisted.
    pub async fn resume_active(
        &self,
        registry: &dyn CameraRegistry,
    ) -> Result<ResumeReport, RegistryError> {
        let cameras = registry.active_cameras()?;
        let mut report = ResumeReport::default();
        for camera in cameras {
            match self.start_camera(&camera).await {
                Ok(Some(_)) => report.started.push(camera.id),
                Ok(None) => report.skipped.push(camera.id),
                Err(err) => {
                    error!(camera_id = %camera.id, error = %err, "failed to resume recording");
                    report.failed.push(camera.id);
                }
            }
        }
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "active cameras resumed"
        );
        Ok(report)
    }

    fn notify(&self, event: RecordingEvent) {
        match event {
            RecordingEvent::Started { camera_id, pid } => {
                debug!(camera_id = %camera_id, pid, event = "recording.started", "recording event");
            }
            RecordingEvent::Stopped { camera_id } => {
                debug!(camera_id = %camera_id, event = "recording.stopped", "recording event");
            }
        }
    }
}

static GLOBAL: OnceLock<Arc<RecordingOrchestrator>> = OnceLock::new();

/// Installs the process-wide orchestrator. Only the first call wins; later
/// calls get their orchestrator handed back.
pub fn install_global(
    orchestrator: Arc<RecordingOrchestrator>,
) -> Result<&'static Arc<RecordingOrchestrator>, Arc<RecordingOrchestrator>> {
    let mut installed = false;
    let current = GLOBAL.get_or_init(|| {
        installed = true;
        Arc::clone(&orchestrator)
    });
    if installed {
        Ok(current)
    } else {
        Err(orchestrator)
    }
}

pub fn global() -> Option<&'static Arc<RecordingOrchestrator>> {
    GLOBAL.get()
}
