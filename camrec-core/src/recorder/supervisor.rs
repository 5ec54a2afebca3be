use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::command::{build_recording_command, CommandRequest, RecordingSettings};
use super::process::{
    Delivery, ExitOutcome, ManagedProcess, ProcessProbe, ProcessSignal, ProcessSpawner,
    SystemProcessProbe, SystemProcessSpawner,
};
use crate::config::SupervisorSection;
use crate::hardware::HardwareProfile;
use crate::registry::Protocol;
use crate::storage::RecordingLayout;

const PROCESS_NOT_FOUND: &str = "process not found";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch recorder for camera {camera_id} ({command}): {source}")]
    Launch {
        camera_id: String,
        command: String,
        source: io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("recorder for camera {camera_id} (pid {pid}) survived SIGKILL")]
    StopTimeout { camera_id: String, pid: u32 },
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub monitor_interval: Duration,
    pub restart_max_attempts: u32,
    pub restart_delay: Duration,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorSection::default())
    }
}

impl From<&SupervisorSection> for SupervisorSettings {
    fn from(section: &SupervisorSection) -> Self {
        Self {
            monitor_interval: section.monitor_interval(),
            restart_max_attempts: section.restart_max_attempts,
            restart_delay: section.restart_delay(),
            stop_grace: section.stop_grace(),
            kill_wait: section.kill_wait(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingSource {
    pub url: String,
    pub protocol: Protocol,
    pub transcode: bool,
    /// Live re-stream target used with authenticated pull sources.
    pub publish_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartRequest {
    pub camera_id: String,
    pub client_slug: String,
    pub camera_name: String,
    pub source: RecordingSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Stopped,
    Running,
    Crashed,
    Restarting,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Stopped => "stopped",
            JobStatus::Running => "running",
            JobStatus::Crashed => "crashed",
            JobStatus::Restarting => "restarting",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => *pid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotTracked,
    /// The process had already exited before any signal was needed.
    Exited,
    Terminated,
    Killed,
    /// Still alive after SIGKILL; dropped from tracking anyway.
    Abandoned { pid: u32 },
}

/// Point-in-time view of one job, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub camera_id: String,
    pub client_slug: String,
    pub camera_name: String,
    pub status: JobStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub output_dir: PathBuf,
    pub protocol: Protocol,
    pub transcode: bool,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

struct RecordingJob {
    request: StartRequest,
    process: Box<dyn ManagedProcess>,
    pid: u32,
    started_at: DateTime<Utc>,
    status: JobStatus,
    error_count: u32,
    last_error: Option<String>,
    output_dir: PathBuf,
}

impl RecordingJob {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            camera_id: self.request.camera_id.clone(),
            client_slug: self.request.client_slug.clone(),
            camera_name: self.request.camera_name.clone(),
            status: self.status,
            pid: Some(self.pid),
            started_at: Some(self.started_at),
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            output_dir: self.output_dir.clone(),
            protocol: self.request.source.protocol,
            transcode: self.request.source.transcode,
            cpu_percent: None,
            memory_mb: None,
        }
    }
}

type JobGuard = OwnedMutexGuard<Option<RecordingJob>>;

/// One camera's lifecycle lock plus the last published view of its job.
/// The lock is held for a whole transition; the view can be read at any time.
#[derive(Default)]
struct Slot {
    job: Arc<AsyncMutex<Option<RecordingJob>>>,
    view: RwLock<Option<JobSnapshot>>,
}

impl Slot {
    fn publish(&self, job: Option<&RecordingJob>) {
        let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
        *view = job.map(RecordingJob::snapshot);
    }

    fn view(&self) -> Option<JobSnapshot> {
        self.view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    layout: RecordingLayout,
    profile: HardwareProfile,
    recording: RecordingSettings,
    settings: SupervisorSettings,
    spawner: Arc<dyn ProcessSpawner>,
    probe: Arc<dyn ProcessProbe>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Owns every recording process and keeps at most one per camera.
#[derive(Clone)]
pub struct JobSupervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSupervisor")
            .field("layout", &self.inner.layout)
            .field("profile", &self.inner.profile)
            .field("settings", &self.inner.settings)
            .field("jobs", &self.inner.slots().len())
            .finish()
    }
}

impl JobSupervisor {
    pub fn new(
        layout: RecordingLayout,
        profile: HardwareProfile,
        recording: RecordingSettings,
        settings: SupervisorSettings,
        spawner: Option<Arc<dyn ProcessSpawner>>,
        probe: Option<Arc<dyn ProcessProbe>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                layout,
                profile,
                recording,
                settings,
                spawner: spawner.unwrap_or_else(|| Arc::new(SystemProcessSpawner)),
                probe: probe.unwrap_or_else(|| Arc::new(SystemProcessProbe)),
                slots: Mutex::new(HashMap::new()),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn layout(&self) -> &RecordingLayout {
        &self.inner.layout
    }

    /// Starts the periodic crash monitor. Calling it again while one is
    /// running does nothing.
    pub fn spawn_monitor(&self) {
        let mut monitor = self.inner.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.monitor_interval;
        let task = tokio::spawn(async move {
            info!(interval_s = interval.as_secs(), "recording monitor started");
            loop {
                tokio::select! {
                    _ = sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.monitor_pass().await;
            }
            info!("recording monitor stopped");
        });
        *monitor = Some(MonitorHandle { shutdown, task });
    }

    pub fn monitor_running(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// One pass of the crash monitor over every tracked job.
    pub async fn run_monitor_pass(&self) {
        self.inner.monitor_pass().await;
    }

    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome, SupervisorError> {
        self.inner.start(request).await
    }

    pub async fn stop(&self, camera_id: &str) -> Result<StopOutcome, SupervisorError> {
        self.inner.stop(camera_id).await
    }

    pub async fn status(&self, camera_id: &str) -> Option<JobSnapshot> {
        let slot = self.inner.slots().get(camera_id).cloned()?;
        Some(self.inner.probe_view(slot.view()?).await)
    }

    pub async fn status_all(&self) -> Vec<JobSnapshot> {
        let slots: Vec<Arc<Slot>> = self.inner.slots().values().cloned().collect();
        let views = slots.iter().filter_map(|slot| slot.view());
        let mut snapshots = join_all(views.map(|view| self.inner.probe_view(view))).await;
        snapshots.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        snapshots
    }

    pub fn tracked_cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.slots().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops every job concurrently, then halts the monitor and waits for it.
    pub async fn shutdown(&self) {
        let ids = self.tracked_cameras();
        let results = join_all(ids.iter().map(|id| self.inner.stop(id))).await;
        for (camera_id, result) in ids.iter().zip(results) {
            if let Err(err) = result {
                error!(camera_id = %camera_id, error = %err, "stop during shutdown failed");
            }
        }

        let handle = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            if let Err(err) = handle.task.await {
                warn!(error = %err, "recording monitor task ended abnormally");
            }
        }
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks a tracked camera's slot. A slot retired while we waited is
    /// skipped and the lookup retried.
    async fn lock_slot(&self, camera_id: &str) -> Option<(Arc<Slot>, JobGuard)> {
        loop {
            let slot = self.slots().get(camera_id).cloned()?;
            if let Some(guard) = self.acquire(camera_id, &slot).await {
                return Some((slot, guard));
            }
        }
    }

    async fn lock_or_insert_slot(&self, camera_id: &str) -> (Arc<Slot>, JobGuard) {
        loop {
            let slot = Arc::clone(
                self.slots()
                    .entry(camera_id.to_string())
                    .or_insert_with(|| Arc::new(Slot::default())),
            );
            if let Some(guard) = self.acquire(camera_id, &slot).await {
                return (slot, guard);
            }
        }
    }

    async fn acquire(&self, camera_id: &str, slot: &Arc<Slot>) -> Option<JobGuard> {
        let guard = Arc::clone(&slot.job).lock_owned().await;
        let current = self
            .slots()
            .get(camera_id)
            .is_some_and(|existing| Arc::ptr_eq(existing, slot));
        current.then_some(guard)
    }

    /// Publishes the job view and retires the slot if it is now empty.
    /// Must run before the guard is dropped.
    fn settle(&self, camera_id: &str, slot: &Arc<Slot>, guard: &JobGuard) {
        slot.publish(guard.as_ref());
        if guard.is_none() {
            let mut slots = self.slots();
            if slots
                .get(camera_id)
                .is_some_and(|existing| Arc::ptr_eq(existing, slot))
            {
                slots.remove(camera_id);
            }
        }
    }

    async fn start(&self, request: StartRequest) -> Result<StartOutcome, SupervisorError> {
        let camera_id = request.camera_id.clone();
        let (slot, mut guard) = self.lock_or_insert_slot(&camera_id).await;

        if let Some(job) = guard.as_mut() {
            match job.process.try_wait() {
                Ok(None) => {
                    debug!(camera_id = %camera_id, pid = job.pid, "recording already running");
                    return Ok(StartOutcome::AlreadyRunning { pid: job.pid });
                }
                Ok(Some(outcome)) => {
                    info!(
                        camera_id = %camera_id,
                        pid = job.pid,
                        exit = %outcome,
                        "replacing exited recording job"
                    );
                }
                Err(err) => {
                    warn!(camera_id = %camera_id, error = %err, "cannot poll recorder, replacing job");
                    let _ = job.process.signal(ProcessSignal::Kill);
                }
            }
            *guard = None;
        }

        let result = self.launch(request).await;
        match result {
            Ok(job) => {
                let pid = job.pid;
                *guard = Some(job);
                self.settle(&camera_id, &slot, &guard);
                Ok(StartOutcome::Started { pid })
            }
            Err(err) => {
                self.settle(&camera_id, &slot, &guard);
                Err(err)
            }
        }
    }

    async fn launch(&self, request: StartRequest) -> Result<RecordingJob, SupervisorError> {
        let output_dir = self.layout.output_dir(
            &request.client_slug,
            &request.camera_name,
            request.source.transcode,
        );
        let process = self.relaunch(&request, &output_dir).await?;
        let pid = process.pid();
        info!(
            camera_id = %request.camera_id,
            pid,
            transcode = request.source.transcode,
            output = %output_dir.display(),
            "recording started"
        );
        Ok(RecordingJob {
            request,
            process,
            pid,
            started_at: Utc::now(),
            status: JobStatus::Running,
            error_count: 0,
            last_error: None,
            output_dir,
        })
    }

    /// Recreates the output directory and spawns a recorder into it.
    async fn relaunch(
        &self,
        request: &StartRequest,
        output_dir: &std::path::Path,
    ) -> Result<Box<dyn ManagedProcess>, SupervisorError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| SupervisorError::Io {
                source,
                path: output_dir.to_path_buf(),
            })?;
        self.spawn_process(request, output_dir)
    }

    fn spawn_process(
        &self,
        request: &StartRequest,
        output_dir: &std::path::Path,
    ) -> Result<Box<dyn ManagedProcess>, SupervisorError> {
        let command = build_recording_command(
            &CommandRequest {
                source_url: request.source.url.clone(),
                transcode: request.source.transcode,
                output_dir: output_dir.to_path_buf(),
                publish_target: request.source.publish_target.clone(),
            },
            &self.profile,
            &self.recording,
        );
        debug!(camera_id = %request.camera_id, command = %command.redacted(), "launching recorder");
        self.spawner
            .spawn(&command)
            .map_err(|source| SupervisorError::Launch {
                camera_id: request.camera_id.clone(),
                command: command.redacted(),
                source,
            })
    }

    async fn stop(&self, camera_id: &str) -> Result<StopOutcome, SupervisorError> {
        let Some((slot, mut guard)) = self.lock_slot(camera_id).await else {
            debug!(camera_id = %camera_id, "no recording job to stop");
            return Ok(StopOutcome::NotTracked);
        };
        let Some(mut job) = guard.take() else {
            self.settle(camera_id, &slot, &guard);
            return Ok(StopOutcome::NotTracked);
        };

        let outcome = self.terminate(camera_id, job.process.as_mut()).await;
        self.settle(camera_id, &slot, &guard);
        drop(guard);

        match outcome {
            StopOutcome::Abandoned { pid } => {
                error!(camera_id = %camera_id, pid, "recorder survived SIGKILL, no longer tracked");
                Err(SupervisorError::StopTimeout {
                    camera_id: camera_id.to_string(),
                    pid,
                })
            }
            outcome => {
                info!(camera_id = %camera_id, pid = job.pid, ?outcome, "recording stopped");
                Ok(outcome)
            }
        }
    }

    /// SIGTERM to the process group, then SIGKILL after the grace period.
    async fn terminate(&self, camera_id: &str, process: &mut dyn ManagedProcess) -> StopOutcome {
        let pid = process.pid();
        if let Ok(Some(_)) = process.try_wait() {
            return StopOutcome::Exited;
        }

        match process.signal(ProcessSignal::Terminate) {
            Ok(Delivery::Gone) => {
                let _ = timeout(self.settings.kill_wait, process.wait()).await;
                return StopOutcome::Exited;
            }
            Ok(Delivery::Delivered) => {
                if let Ok(Ok(_)) = timeout(self.settings.stop_grace, process.wait()).await {
                    return StopOutcome::Terminated;
                }
                warn!(camera_id = %camera_id, pid, "recorder ignored SIGTERM, sending SIGKILL");
            }
            Err(err) => {
                warn!(camera_id = %camera_id, pid, error = %err, "SIGTERM failed, sending SIGKILL");
            }
        }

        match process.signal(ProcessSignal::Kill) {
            Ok(Delivery::Gone) => StopOutcome::Killed,
            Ok(Delivery::Delivered) => match timeout(self.settings.kill_wait, process.wait()).await {
                Ok(Ok(_)) => StopOutcome::Killed,
                _ => StopOutcome::Abandoned { pid },
            },
            Err(err) => {
                warn!(camera_id = %camera_id, pid, error = %err, "SIGKILL failed");
                StopOutcome::Abandoned { pid }
            }
        }
    }

    async fn probe_view(&self, mut view: JobSnapshot) -> JobSnapshot {
        if view.status != JobStatus::Running {
            return view;
        }
        let Some(pid) = view.pid else {
            return view;
        };
        if !self.probe.is_alive(pid) {
            view.status = JobStatus::Crashed;
            view.last_error = Some(PROCESS_NOT_FOUND.to_string());
            return view;
        }
        if let Some(usage) = self.probe.usage(pid).await {
            view.cpu_percent = Some(usage.cpu_percent);
            view.memory_mb = Some(usage.memory_mb);
        }
        view
    }

    async fn monitor_pass(&self) {
        let ids: Vec<String> = self.slots().keys().cloned().collect();
        for camera_id in ids {
            self.check_job(&camera_id).await;
        }
    }

    async fn check_job(&self, camera_id: &str) {
        let Some((slot, mut guard)) = self.lock_slot(camera_id).await else {
            return;
        };
        let Some(job) = guard.as_mut() else {
            self.settle(camera_id, &slot, &guard);
            return;
        };

        let outcome = match job.process.try_wait() {
            Ok(None) => return,
            Ok(Some(outcome)) => outcome,
            Err(err) => {
                warn!(camera_id = %camera_id, pid = job.pid, error = %err, "cannot poll recorder");
                return;
            }
        };

        if outcome.success() {
            info!(camera_id = %camera_id, pid = job.pid, "recording ended normally");
            *guard = None;
            self.settle(camera_id, &slot, &guard);
            return;
        }

        self.record_crash(camera_id, job, outcome);
        if job.error_count >= self.settings.restart_max_attempts {
            error!(
                camera_id = %camera_id,
                failures = job.error_count,
                "too many recorder failures, giving up"
            );
            *guard = None;
            self.settle(camera_id, &slot, &guard);
            return;
        }

        job.status = JobStatus::Restarting;
        slot.publish(Some(&*job));
        info!(camera_id = %camera_id, attempt = job.error_count, "restarting recorder");

        // Sweep anything left in the old process group before relaunching.
        let _ = job.process.signal(ProcessSignal::Kill);
        sleep(self.settings.restart_delay).await;

        match self.relaunch(&job.request, &job.output_dir).await {
            Ok(process) => {
                job.pid = process.pid();
                job.process = process;
                job.started_at = Utc::now();
                job.status = JobStatus::Running;
                info!(camera_id = %camera_id, pid = job.pid, "recorder restarted");
            }
            Err(err) => {
                error!(camera_id = %camera_id, error = %err, "recorder restart failed, dropping job");
                *guard = None;
            }
        }
        self.settle(camera_id, &slot, &guard);
    }

    fn record_crash(&self, camera_id: &str, job: &mut RecordingJob, outcome: ExitOutcome) {
        job.error_count += 1;
        job.status = JobStatus::Crashed;
        let stderr = job.process.stderr_tail();
        let description = if stderr.is_empty() {
            format!("recorder exited with {outcome}")
        } else {
            format!("recorder exited with {outcome}: {stderr}")
        };
        error!(
            camera_id = %camera_id,
            pid = job.pid,
            exit = %outcome,
            failures = job.error_count,
            stderr = %stderr,
            "recording crashed"
        );
        job.last_error = Some(description);
    }
}
