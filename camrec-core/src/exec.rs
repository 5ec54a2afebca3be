use std::process::Output;

use tokio::process::Command;

/// Runs short-lived helper commands (`nvidia-smi`, `pkill`, `docker`).
/// Long-running recording processes go through
/// [`ProcessSpawner`](crate::recorder::ProcessSpawner) instead.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.kill_on_drop(true).output().await
    }
}

/// Renders a command as `program arg arg` for logs and error messages.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}
