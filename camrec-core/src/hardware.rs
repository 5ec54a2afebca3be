use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::exec::{CommandExecutor, SystemCommandExecutor};

const NVIDIA_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("nvidia-smi probe timed out after {0:?}")]
    ProbeTimeout(Duration),
    #[error("io error running {command}: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    Nvenc,
    Vaapi,
    Software,
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Accelerator::Nvenc => "nvenc",
            Accelerator::Vaapi => "vaapi",
            Accelerator::Software => "software",
        };
        f.write_str(label)
    }
}

/// Encoder choice for transcoded recordings, fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareProfile {
    pub encoder: String,
    pub preset: String,
    pub accelerator: Accelerator,
    /// Render node passed to VAAPI; unused by the other accelerators.
    pub device: Option<PathBuf>,
}

impl HardwareProfile {
    pub fn nvenc() -> Self {
        Self {
            encoder: "hevc_nvenc".into(),
            preset: "p4".into(),
            accelerator: Accelerator::Nvenc,
            device: None,
        }
    }

    pub fn vaapi(device: impl Into<PathBuf>) -> Self {
        Self {
            encoder: "hevc_vaapi".into(),
            preset: "medium".into(),
            accelerator: Accelerator::Vaapi,
            device: Some(device.into()),
        }
    }

    pub fn software() -> Self {
        Self {
            encoder: "libx265".into(),
            preset: "medium".into(),
            accelerator: Accelerator::Software,
            device: None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.accelerator != Accelerator::Software
    }
}

pub struct HardwareDetector {
    executor: Arc<dyn CommandExecutor>,
    render_node: PathBuf,
}

impl fmt::Debug for HardwareDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareDetector")
            .field("render_node", &self.render_node)
            .finish()
    }
}

impl Default for HardwareDetector {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HardwareDetector {
    pub fn new(executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
            render_node: PathBuf::from(DEFAULT_RENDER_NODE),
        }
    }

    pub fn with_render_node(mut self, path: impl AsRef<Path>) -> Self {
        self.render_node = path.as_ref().to_path_buf();
        self
    }

    /// NVIDIA first, then a VAAPI render node, then software x265.
    /// Probe failures only mean "not available" and never surface as errors.
    pub async fn detect(&self) -> HardwareProfile {
        match self.probe_nvidia().await {
            Ok(true) => {
                info!(encoder = "hevc_nvenc", "nvidia encoder detected");
                return HardwareProfile::nvenc();
            }
            Ok(false) => debug!("nvidia-smi reported no gpu"),
            Err(err) => debug!(error = %err, "nvidia probe unavailable"),
        }

        if self.render_node.exists() {
            info!(
                encoder = "hevc_vaapi",
                device = %self.render_node.display(),
                "vaapi render node detected"
            );
            return HardwareProfile::vaapi(&self.render_node);
        }

        info!(encoder = "libx265", "no hardware encoder found, using software");
        HardwareProfile::software()
    }

    async fn probe_nvidia(&self) -> Result<bool, HardwareError> {
        let mut command = Command::new("nvidia-smi");
        command.arg("-L");
        let output = timeout(NVIDIA_PROBE_TIMEOUT, self.executor.run(&mut command))
            .await
            .map_err(|_| HardwareError::ProbeTimeout(NVIDIA_PROBE_TIMEOUT))?
            .map_err(|source| HardwareError::Io {
                command: "nvidia-smi -L".into(),
                source,
            })?;
        Ok(output.status.success() && !String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}

static PROFILE: OnceCell<HardwareProfile> = OnceCell::const_new();

/// Process-wide profile. The first caller runs detection; concurrent callers
/// wait for that result and nothing ever probes again.
pub async fn detect_once() -> &'static HardwareProfile {
    PROFILE
        .get_or_init(|| async { HardwareDetector::default().detect().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedExecutor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn nvidia_listing_selects_nvenc() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push_exit(0, "GPU 0: NVIDIA T4 (UUID: GPU-1234)\n");
        let detector = HardwareDetector::new(Some(executor.clone()));
        let profile = detector.detect().await;
        assert_eq!(profile, HardwareProfile::nvenc());
        assert_eq!(executor.calls.lock().unwrap()[0], "nvidia-smi -L");
    }

    #[tokio::test]
    async fn render_node_selects_vaapi_when_nvidia_missing() {
        let dir = TempDir::new().unwrap();
        let node = dir.path().join("renderD128");
        std::fs::write(&node, b"").unwrap();
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push_error(std::io::ErrorKind::NotFound);
        let detector = HardwareDetector::new(Some(executor)).with_render_node(&node);
        let profile = detector.detect().await;
        assert_eq!(profile.encoder, "hevc_vaapi");
        assert_eq!(profile.preset, "medium");
        assert_eq!(profile.device.as_deref(), Some(node.as_path()));
    }

    #[tokio::test]
    async fn falls_back_to_software() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push_exit(9, "");
        let detector =
            HardwareDetector::new(Some(executor)).with_render_node(dir.path().join("missing"));
        let profile = detector.detect().await;
        assert_eq!(profile, HardwareProfile::software());
        assert!(!profile.is_hardware());
    }
}
