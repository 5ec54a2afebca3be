pub mod command;
pub mod orchestrator;
pub mod process;
pub mod supervisor;

pub use command::{build_recording_command, CommandRequest, RecordingCommand, RecordingSettings};
pub use orchestrator::{
    global, install_global, CameraUpdate, RecordingEvent, RecordingOrchestrator, ResumeReport,
};
pub use process::{
    Delivery, ExitOutcome, ManagedProcess, ProcessProbe, ProcessSignal, ProcessSpawner,
    ResourceUsage, SystemProcessProbe, SystemProcessSpawner,
};
pub use supervisor::{
    JobSnapshot, JobStatus, JobSupervisor, RecordingSource, StartOutcome, StartRequest,
    StopOutcome, SupervisorError, SupervisorSettings,
};
