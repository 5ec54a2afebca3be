use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{PathSource, PathTarget, ReconcileError};

/// One routing path as both the config file and the control API spell it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathConfig {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_on_demand: Option<bool>,
    pub record: bool,
}

impl From<&PathTarget> for PathConfig {
    fn from(target: &PathTarget) -> Self {
        match &target.source {
            PathSource::Pull { url, on_demand } => Self {
                source: url.clone(),
                source_on_demand: Some(*on_demand),
                record: target.record,
            },
            PathSource::Publisher => Self {
                source: "publisher".into(),
                source_on_demand: None,
                record: target.record,
            },
        }
    }
}

/// Full media-server configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaServerDocument {
    pub log_level: String,
    pub log_destinations: Vec<String>,
    pub api: bool,
    pub api_address: String,
    pub metrics: bool,
    pub metrics_address: String,
    pub hls: bool,
    pub hls_address: String,
    pub hls_always_remux: bool,
    pub hls_variant: String,
    pub hls_segment_count: u32,
    pub hls_segment_duration: String,
    pub hls_part_duration: String,
    pub hls_segment_max_size: String,
    pub rtsp_address: String,
    pub path_defaults: PathConfig,
    pub paths: BTreeMap<String, PathConfig>,
}

impl Default for MediaServerDocument {
    fn default() -> Self {
        let publisher = PathConfig {
            source: "publisher".into(),
            source_on_demand: Some(false),
            record: false,
        };
        let mut paths = BTreeMap::new();
        paths.insert("health".to_string(), publisher.clone());
        Self {
            log_level: "info".into(),
            log_destinations: vec!["stdout".into()],
            api: true,
            api_address: ":9997".into(),
            metrics: true,
            metrics_address: ":9998".into(),
            hls: true,
            hls_address: ":8888".into(),
            hls_always_remux: false,
            hls_variant: "mpegts".into(),
            hls_segment_count: 10,
            hls_segment_duration: "1s".into(),
            hls_part_duration: "200ms".into(),
            hls_segment_max_size: "50M".into(),
            rtsp_address: ":8554".into(),
            path_defaults: publisher,
            paths,
        }
    }
}

impl MediaServerDocument {
    pub fn with_targets<'a>(targets: impl IntoIterator<Item = &'a PathTarget>) -> Self {
        let mut document = Self::default();
        for target in targets {
            document
                .paths
                .insert(target.path.clone(), PathConfig::from(target));
        }
        document
    }

    pub fn to_yaml(&self) -> Result<String, ReconcileError> {
        let body = serde_yaml::to_string(self)?;
        Ok(format!(
            "# Generated by camrec. Cameras are recorded by camrec, never by the media server.\n{body}"
        ))
    }

    /// Writes through a temp file in the target directory so readers never
    /// see a half-written config.
    pub fn write_atomic(&self, path: &Path) -> Result<(), ReconcileError> {
        let yaml = self.to_yaml()?;
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |source| ReconcileError::Io {
            source,
            path: path.to_path_buf(),
        };
        std::fs::create_dir_all(parent).map_err(io_err)?;
        let mut file = NamedTempFile::new_in(parent).map_err(io_err)?;
        file.write_all(yaml.as_bytes()).map_err(io_err)?;
        file.as_file().sync_all().map_err(io_err)?;
        file.persist(path).map_err(|err| io_err(err.error))?;
        Ok(())
    }
}
