use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::command::RecordingCommand;

pub const STDERR_TAIL_BYTES: usize = 500;
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
}

impl ProcessSignal {
    fn as_raw(self) -> libc::c_int {
        match self {
            ProcessSignal::Terminate => libc::SIGTERM,
            ProcessSignal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The process group no longer exists.
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// A launched recorder. Implementations own the OS handle; nothing outside
/// the supervisor ever sees one.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    fn pid(&self) -> u32;

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>>;

    async fn wait(&mut self) -> io::Result<ExitOutcome>;

    /// Signals the whole process group the recorder leads.
    fn signal(&self, signal: ProcessSignal) -> io::Result<Delivery>;

    fn stderr_tail(&self) -> String;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &RecordingCommand) -> io::Result<Box<dyn ManagedProcess>>;
}

#[derive(Debug, Default)]
pub struct SystemProcessSpawner;

impl ProcessSpawner for SystemProcessSpawner {
    fn spawn(&self, command: &RecordingCommand) -> io::Result<Box<dyn ManagedProcess>> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned process has no pid"))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_BYTES)));
        let reader = child.stderr.take().map(|mut stderr| {
            let tail = Arc::clone(&tail);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => {
                            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                            tail.extend(&buf[..read]);
                            let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                            tail.drain(..excess);
                        }
                    }
                }
            })
        });

        debug!(pid, "recorder process spawned");
        Ok(Box::new(SystemProcess {
            child,
            pid,
            tail,
            reader,
        }))
    }
}

struct SystemProcess {
    child: Child,
    pid: u32,
    tail: Arc<Mutex<VecDeque<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Drop for SystemProcess {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl ManagedProcess for SystemProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from))
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        Ok(self.child.wait().await?.into())
    }

    fn signal(&self, signal: ProcessSignal) -> io::Result<Delivery> {
        // SAFETY: killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(self.pid as libc::pid_t, signal.as_raw()) };
        if rc == 0 {
            return Ok(Delivery::Delivered);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(Delivery::Gone)
        } else {
            Err(err)
        }
    }

    fn stderr_tail(&self) -> String {
        let tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        let (front, back) = tail.as_slices();
        let mut bytes = Vec::with_capacity(tail.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[async_trait]
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    async fn usage(&self, pid: u32) -> Option<ResourceUsage>;
}

/// Probes the live process table through `kill(pid, 0)` and `/proc`.
#[derive(Debug, Default)]
pub struct SystemProcessProbe;

#[async_trait]
impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        // SAFETY: signal 0 only performs the existence and permission check.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        if !exists {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => parse_stat(&stat).map_or(true, |stat| stat.state != 'Z'),
            Err(_) => true,
        }
    }

    async fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        let stat_path = format!("/proc/{pid}/stat");
        let first = parse_stat(&tokio::fs::read_to_string(&stat_path).await.ok()?)?;
        tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
        let second = parse_stat(&tokio::fs::read_to_string(&stat_path).await.ok()?)?;
        let statm = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
            .await
            .ok()?;

        // SAFETY: sysconf only reads static system configuration.
        let (ticks_per_second, page_size) =
            unsafe { (libc::sysconf(libc::_SC_CLK_TCK), libc::sysconf(libc::_SC_PAGESIZE)) };
        if ticks_per_second <= 0 || page_size <= 0 {
            return None;
        }

        let ticks = second.cpu_ticks().saturating_sub(first.cpu_ticks());
        let cpu_percent =
            ticks as f64 / ticks_per_second as f64 / CPU_SAMPLE_WINDOW.as_secs_f64() * 100.0;
        let rss_pages = parse_statm_rss(&statm)?;
        let memory_mb = rss_pages as f64 * page_size as f64 / 1024.0 / 1024.0;
        Some(ResourceUsage {
            cpu_percent: round1(cpu_percent),
            memory_mb: round1(memory_mb),
        })
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    utime: u64,
    stime: u64,
}

impl ProcStat {
    fn cpu_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Parses `/proc/<pid>/stat`. The command name may itself contain spaces
/// and parentheses, so fields are counted from the last `)`.
fn parse_stat(raw: &str) -> Option<ProcStat> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        state: fields.first()?.chars().next()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
    })
}

fn parse_statm_rss(raw: &str) -> Option<u64> {
    raw.split_whitespace().nth(1)?.parse().ok()
}
