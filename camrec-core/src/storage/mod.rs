//! On-disk layout of the recordings root.
//!
//! ```text
//! {root}/live/{client_slug}/{camera_name}_h265/2025-10-27_19-41-28.mp4
//! {root}/live/{client_slug}/{camera_name}_h264/...
//! {root}/live/{client_slug}/{camera_name}/...        (legacy, unsuffixed)
//! ```

pub mod timeline;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

pub use timeline::{Segment, Timeline, TimelineBuilder};

pub const SEGMENT_EXTENSION: &str = "mp4";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("invalid path component {0:?}")]
    InvalidName(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    H265,
    H264,
}

impl CodecFamily {
    pub fn for_transcode(transcode: bool) -> Self {
        if transcode {
            CodecFamily::H265
        } else {
            CodecFamily::H264
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            CodecFamily::H265 => "h265",
            CodecFamily::H264 => "h264",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingLayout {
    root: PathBuf,
}

/// A single path component: no separators, no parent references.
fn is_plain_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
        && !value.contains("..")
}

impl RecordingLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn client_dir(&self, client_slug: &str) -> PathBuf {
        self.root.join("live").join(client_slug)
    }

    /// Directory the recorder writes to; the codec suffix keeps transcoded
    /// and passthrough output apart.
    pub fn output_dir(&self, client_slug: &str, camera_name: &str, transcode: bool) -> PathBuf {
        let family = CodecFamily::for_transcode(transcode);
        self.client_dir(client_slug)
            .join(format!("{camera_name}_{}", family.suffix()))
    }

    /// Transcoded, passthrough, then legacy, in lookup order.
    pub fn candidate_dirs(&self, client_slug: &str, camera_name: &str) -> [PathBuf; 3] {
        [
            self.output_dir(client_slug, camera_name, true),
            self.output_dir(client_slug, camera_name, false),
            self.client_dir(client_slug).join(camera_name),
        ]
    }

    /// First existing candidate directory.
    pub fn resolve_dir(&self, client_slug: &str, camera_name: &str) -> Option<PathBuf> {
        self.candidate_dirs(client_slug, camera_name)
            .into_iter()
            .find(|dir| dir.is_dir())
    }

    /// Maps a segment filename to a file on disk. Anything that could step
    /// outside the camera's directories resolves to `None`.
    pub fn resolve_segment_path(
        &self,
        client_slug: &str,
        camera_name: &str,
        filename: &str,
    ) -> Option<PathBuf> {
        if !is_plain_component(client_slug)
            || !is_plain_component(camera_name)
            || !is_plain_component(filename)
        {
            return None;
        }
        let is_segment = Path::new(filename)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(SEGMENT_EXTENSION));
        if !is_segment {
            return None;
        }
        self.candidate_dirs(client_slug, camera_name)
            .into_iter()
            .map(|dir| dir.join(filename))
            .find(|path| path.is_file())
    }

    /// Removes every recording directory of one camera. Returns how many
    /// directories existed.
    pub fn cleanup_camera(&self, client_slug: &str, camera_name: &str) -> StorageResult<usize> {
        for value in [client_slug, camera_name] {
            if !is_plain_component(value) {
                return Err(StorageError::InvalidName(value.to_string()));
            }
        }
        let mut removed = 0;
        for dir in self.candidate_dirs(client_slug, camera_name) {
            if remove_tree(&dir)? {
                info!(path = %dir.display(), "camera recordings removed");
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn cleanup_client(&self, client_slug: &str) -> StorageResult<bool> {
        if !is_plain_component(client_slug) {
            return Err(StorageError::InvalidName(client_slug.to_string()));
        }
        let dir = self.client_dir(client_slug);
        let removed = remove_tree(&dir)?;
        if removed {
            info!(path = %dir.display(), "client recordings removed");
        }
        Ok(removed)
    }
}

fn remove_tree(dir: &Path) -> StorageResult<bool> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StorageError::Io {
            source,
            path: dir.to_path_buf(),
        }),
    }
}
