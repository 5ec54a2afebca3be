pub mod callbacks;
pub mod config;
pub mod error;
pub mod exec;
pub mod hardware;
pub mod media_server;
pub mod recorder;
pub mod registry;
pub mod sqlite;
pub mod storage;

pub use callbacks::{CallbackReply, PublishCallbacks, PublishNotification};
pub use config::{load_camrec_config, CamrecConfig};
pub use error::{ConfigError, Result};
pub use exec::{CommandExecutor, SystemCommandExecutor};
pub use hardware::{detect_once, Accelerator, HardwareDetector, HardwareError, HardwareProfile};
pub use media_server::{
    publish_path, sanitize_name, DeleteOutcome, MediaServerApi, MediaServerDocument, PathConfig,
    PathSource, PathTarget, ReconcileAction, ReconcileError, Reconciler, ReloadMethod, SyncReport,
};
pub use recorder::{
    build_recording_command, CameraUpdate, CommandRequest, JobSnapshot, JobStatus, JobSupervisor,
    ManagedProcess, ProcessProbe, ProcessSpawner, RecordingCommand, RecordingOrchestrator,
    RecordingSettings, RecordingSource, ResumeReport, StartOutcome, StartRequest, StopOutcome,
    SupervisorError, SupervisorSettings,
};
pub use registry::{
    CameraRecord, CameraRegistry, ClientRecord, MemoryRegistry, Protocol, RegistryError,
    RegistryResult, SqliteRegistry, SqliteRegistryBuilder,
};
pub use storage::{RecordingLayout, Segment, StorageError, Timeline, TimelineBuilder};

use std::sync::Arc;

/// Wires a supervisor and orchestrator from config. The caller still owns
/// the monitor start and the global install.
pub fn build_orchestrator(
    config: &CamrecConfig,
    profile: HardwareProfile,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    probe: Option<Arc<dyn ProcessProbe>>,
) -> RecordingOrchestrator {
    let supervisor = JobSupervisor::new(
        RecordingLayout::new(&config.paths.recordings_root),
        profile,
        RecordingSettings::from(config),
        SupervisorSettings::from(&config.supervisor),
        spawner,
        probe,
    );
    RecordingOrchestrator::new(supervisor, config.media_server.rtsp_base.clone())
}
