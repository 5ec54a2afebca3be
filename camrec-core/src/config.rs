use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CamrecConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub recording: RecordingSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub timeline: TimelineSection,
    #[serde(default)]
    pub media_server: MediaServerSection,
    #[serde(default)]
    pub callbacks: CallbacksSection,
}

impl CamrecConfig {
    /// Checks the policy values that would otherwise produce a broken
    /// recorder (zero-length segments, a monitor that never sleeps).
    pub fn validate(&self) -> Result<()> {
        if self.recording.segment_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "recording.segment_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.supervisor.monitor_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "supervisor.monitor_interval_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.timeline.freshness_threshold_seconds < self.recording.segment_seconds {
            return Err(ConfigError::Invalid {
                field: "timeline.freshness_threshold_seconds",
                reason: format!(
                    "must not be shorter than one segment ({}s)",
                    self.recording.segment_seconds
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub recordings_root: PathBuf,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    pub registry_db: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingSection {
    pub segment_seconds: u64,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub log_level: String,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            segment_seconds: 120,
            video_bitrate: "2M".into(),
            audio_bitrate: "128k".into(),
            log_level: "warning".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub monitor_interval_seconds: u64,
    pub restart_max_attempts: u32,
    pub restart_delay_seconds: u64,
    pub stop_grace_seconds: u64,
    pub kill_wait_seconds: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: 30,
            restart_max_attempts: 3,
            restart_delay_seconds: 2,
            stop_grace_seconds: 10,
            kill_wait_seconds: 5,
        }
    }
}

impl SupervisorSection {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimelineSection {
    pub freshness_threshold_seconds: u64,
}

impl Default for TimelineSection {
    fn default() -> Self {
        Self {
            freshness_threshold_seconds: 130,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaServerSection {
    pub api_url: String,
    pub config_path: PathBuf,
    pub rtsp_base: String,
    pub process_name: String,
    pub container_name: String,
    pub restart_script: Option<PathBuf>,
    pub request_timeout_seconds: u64,
}

impl Default for MediaServerSection {
    fn default() -> Self {
        Self {
            api_url: "http://mediamtx:9997".into(),
            config_path: PathBuf::from("/app/config/mediamtx/mediamtx.yml"),
            rtsp_base: "rtsp://mediamtx:8554".into(),
            process_name: "mediamtx".into(),
            container_name: "mediamtx".into(),
            restart_script: None,
            request_timeout_seconds: 10,
        }
    }
}

impl MediaServerSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbacksSection {
    pub publish_source_base: String,
}

impl Default for CallbacksSection {
    fn default() -> Self {
        Self {
            publish_source_base: "rtmp://srs:1935/live".into(),
        }
    }
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

pub fn load_camrec_config<P: AsRef<Path>>(path: P) -> Result<CamrecConfig> {
    let config: CamrecConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
