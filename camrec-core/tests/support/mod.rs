#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use camrec_core::recorder::{
    Delivery, ExitOutcome, ManagedProcess, ProcessProbe, ProcessSignal, ProcessSpawner,
    RecordingCommand, ResourceUsage,
};
use camrec_core::{
    CameraRecord, ClientRecord, CommandExecutor, HardwareProfile, JobSupervisor, MemoryRegistry,
    Protocol, RecordingLayout, RecordingOrchestrator, RecordingSettings, SupervisorSettings,
};
use tokio::process::Command;
use tokio::sync::watch;

pub type EventLog = Arc<Mutex<Vec<String>>>;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Test-side control over one fake recorder.
#[derive(Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub command: RecordingCommand,
    exit: Arc<watch::Sender<Option<ExitOutcome>>>,
    signals: Arc<Mutex<Vec<ProcessSignal>>>,
}

impl ProcessHandle {
    pub fn exit_with(&self, code: i32) {
        self.exit.send_replace(Some(ExitOutcome {
            code: Some(code),
            signal: None,
        }));
    }

    pub fn signals(&self) -> Vec<ProcessSignal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

struct FakeProcess {
    handle: ProcessHandle,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    ignore_terminate: bool,
    log: EventLog,
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.handle.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(*self.exit_rx.borrow())
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        loop {
            if let Some(outcome) = *self.exit_rx.borrow_and_update() {
                return Ok(outcome);
            }
            if self.exit_rx.changed().await.is_err() {
                return Err(io::Error::new(io::ErrorKind::Other, "fake process dropped"));
            }
        }
    }

    fn signal(&self, signal: ProcessSignal) -> io::Result<Delivery> {
        if self.handle.has_exited() {
            return Ok(Delivery::Gone);
        }
        self.handle.signals.lock().unwrap().push(signal);
        self.log
            .lock()
            .unwrap()
            .push(format!("signal:{}:{:?}", self.handle.pid, signal));
        let raw = match signal {
            ProcessSignal::Terminate if self.ignore_terminate => return Ok(Delivery::Delivered),
            ProcessSignal::Terminate => SIGTERM,
            ProcessSignal::Kill => SIGKILL,
        };
        self.handle.exit.send_replace(Some(ExitOutcome {
            code: None,
            signal: Some(raw),
        }));
        Ok(Delivery::Delivered)
    }

    fn stderr_tail(&self) -> String {
        "Connection refused".to_string()
    }
}

/// Hands out fake recorders with increasing pids and remembers them.
pub struct FakeSpawner {
    next_pid: AtomicU32,
    fail_next: AtomicBool,
    ignore_terminate: AtomicBool,
    spawned: Mutex<Vec<ProcessHandle>>,
    pub log: EventLog,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            fail_next: AtomicBool::new(false),
            ignore_terminate: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl FakeSpawner {
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn ignore_terminate(&self) {
        self.ignore_terminate.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<ProcessHandle> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn latest(&self) -> ProcessHandle {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("at least one spawn")
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, command: &RecordingCommand) -> io::Result<Box<dyn ManagedProcess>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg not found"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (exit, exit_rx) = watch::channel(None);
        let handle = ProcessHandle {
            pid,
            command: command.clone(),
            exit: Arc::new(exit),
            signals: Arc::new(Mutex::new(Vec::new())),
        };
        self.spawned.lock().unwrap().push(handle.clone());
        self.log.lock().unwrap().push(format!("spawn:{pid}"));
        Ok(Box::new(FakeProcess {
            handle,
            exit_rx,
            ignore_terminate: self.ignore_terminate.load(Ordering::SeqCst),
            log: Arc::clone(&self.log),
        }))
    }
}

/// Reports every pid alive unless marked dead.
#[derive(Default)]
pub struct FakeProbe {
    dead: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn mark_dead(&self, pid: u32) {
        self.dead.lock().unwrap().insert(pid);
    }
}

#[async_trait]
impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.lock().unwrap().contains(&pid)
    }

    async fn usage(&self, _pid: u32) -> Option<ResourceUsage> {
        Some(ResourceUsage {
            cpu_percent: 12.5,
            memory_mb: 64.0,
        })
    }
}

/// Records helper commands and answers each with the next scripted exit code.
#[derive(Default)]
pub struct RecordingExecutor {
    pub calls: Mutex<Vec<String>>,
    pub exit_codes: Mutex<Vec<i32>>,
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        let std = command.as_std();
        let mut line = vec![std.get_program().to_string_lossy().into_owned()];
        line.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
        self.calls.lock().unwrap().push(line.join(" "));
        let mut codes = self.exit_codes.lock().unwrap();
        let code = if codes.is_empty() { 0 } else { codes.remove(0) };
        Ok(Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

pub struct Harness {
    pub supervisor: JobSupervisor,
    pub spawner: Arc<FakeSpawner>,
    pub probe: Arc<FakeProbe>,
}

pub fn harness(root: &Path) -> Harness {
    let spawner = Arc::new(FakeSpawner::default());
    let probe = Arc::new(FakeProbe::default());
    let supervisor = JobSupervisor::new(
        RecordingLayout::new(root),
        HardwareProfile::software(),
        RecordingSettings::default(),
        SupervisorSettings::default(),
        Some(spawner.clone()),
        Some(probe.clone()),
    );
    Harness {
        supervisor,
        spawner,
        probe,
    }
}

pub fn orchestrator(root: &Path) -> (RecordingOrchestrator, Arc<FakeSpawner>) {
    let Harness {
        supervisor,
        spawner,
        ..
    } = harness(root);
    (
        RecordingOrchestrator::new(supervisor, "rtsp://mediamtx:8554"),
        spawner,
    )
}

pub fn camera(id: &str, name: &str, protocol: Protocol, endpoint: Option<&str>) -> CameraRecord {
    CameraRecord {
        id: id.into(),
        client_id: "client-acme".into(),
        client_slug: "acme".into(),
        name: name.into(),
        protocol,
        endpoint: endpoint.map(Into::into),
        active: true,
        transcode: false,
    }
}

pub fn registry_with(cameras: &[CameraRecord]) -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    registry.insert_client(ClientRecord {
        id: "client-acme".into(),
        slug: "acme".into(),
    });
    for camera in cameras {
        registry.upsert_camera(camera.clone());
    }
    registry
}
