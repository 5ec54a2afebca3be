use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use super::ReconcileError;
use crate::config::MediaServerSection;
use crate::exec::{describe, CommandExecutor, SystemCommandExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadMethod {
    Signal,
    Script,
    Container,
}

impl fmt::Display for ReloadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReloadMethod::Signal => "signal",
            ReloadMethod::Script => "script",
            ReloadMethod::Container => "container",
        };
        f.write_str(label)
    }
}

/// Makes the media server pick up a rewritten config: SIGHUP first, then
/// the restart script, then a container restart.
pub struct Reloader {
    executor: Arc<dyn CommandExecutor>,
    process_name: String,
    restart_script: Option<PathBuf>,
    container_name: String,
}

impl fmt::Debug for Reloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reloader")
            .field("process_name", &self.process_name)
            .field("restart_script", &self.restart_script)
            .field("container_name", &self.container_name)
            .finish()
    }
}

impl Reloader {
    pub fn new(config: &MediaServerSection, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
            process_name: config.process_name.clone(),
            restart_script: config.restart_script.clone(),
            container_name: config.container_name.clone(),
        }
    }

    pub async fn reload(&self) -> Result<ReloadMethod, ReconcileError> {
        let mut attempts = Vec::new();

        let mut signal = Command::new("pkill");
        signal.args(["-HUP", "-x", self.process_name.as_str()]);
        match self.try_run(&mut signal).await {
            Ok(()) => return Ok(ReloadMethod::Signal),
            Err(reason) => attempts.push(reason),
        }

        if let Some(script) = &self.restart_script {
            let mut restart = Command::new("/bin/bash");
            restart.arg(script);
            match self.try_run(&mut restart).await {
                Ok(()) => return Ok(ReloadMethod::Script),
                Err(reason) => attempts.push(reason),
            }
        }

        let mut container = Command::new("docker");
        container.args(["restart", self.container_name.as_str()]);
        match self.try_run(&mut container).await {
            Ok(()) => Ok(ReloadMethod::Container),
            Err(reason) => {
                attempts.push(reason);
                Err(ReconcileError::ReloadFailed {
                    attempts: attempts.join("; "),
                })
            }
        }
    }

    async fn try_run(&self, command: &mut Command) -> Result<(), String> {
        let line = describe(command);
        match self.executor.run(command).await {
            Ok(output) if output.status.success() => {
                info!(command = %line, "media server reloaded");
                Ok(())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(command = %line, status = ?output.status.code(), stderr = %stderr, "reload step failed");
                Err(format!("{line}: exit {:?}", output.status.code()))
            }
            Err(err) => {
                warn!(command = %line, error = %err, "reload step unavailable");
                Err(format!("{line}: {err}"))
            }
        }
    }
}
