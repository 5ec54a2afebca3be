//! Rebuilds a camera's recording timeline from the segment files on disk.
//!
//! Segment names carry their UTC start time (`2025-10-27_19-41-28.mp4`).
//! Each segment ends where its successor starts; the newest one is judged
//! by its modification time and is reported as still recording while the
//! recorder keeps touching it.

use std::fs::Metadata;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::{RecordingLayout, StorageError, StorageResult, SEGMENT_EXTENSION};
use crate::config::CamrecConfig;

const FILENAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const MIN_SEGMENT_MS: i64 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub filename: String,
    pub size: u64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_seconds: f64,
    pub is_recording: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Playback path relative to the media root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub segments: Vec<Segment>,
    pub total_size: u64,
    pub total_duration_seconds: f64,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub count: usize,
}

impl Timeline {
    pub fn empty() -> Self {
        Self {
            segments: Vec::new(),
            total_size: 0,
            total_duration_seconds: 0.0,
            start_date: None,
            end_date: None,
            count: 0,
        }
    }

    fn from_segments(segments: Vec<Segment>) -> Self {
        let total_size = segments.iter().map(|segment| segment.size).sum();
        let total_duration_seconds = segments
            .iter()
            .map(|segment| segment.duration_seconds)
            .sum();
        let start_date = segments
            .first()
            .and_then(|segment| Utc.timestamp_millis_opt(segment.start_ms).single());
        let end_date = segments
            .last()
            .and_then(|segment| Utc.timestamp_millis_opt(segment.end_ms).single());
        Self {
            count: segments.len(),
            segments,
            total_size,
            total_duration_seconds,
            start_date,
            end_date,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    layout: RecordingLayout,
    segment_length: Duration,
    freshness: Duration,
}

impl TimelineBuilder {
    pub fn new(layout: RecordingLayout) -> Self {
        Self {
            layout,
            segment_length: Duration::from_secs(120),
            freshness: Duration::from_secs(130),
        }
    }

    pub fn from_config(config: &CamrecConfig) -> Self {
        Self::new(RecordingLayout::new(&config.paths.recordings_root))
            .with_segment_length(Duration::from_secs(config.recording.segment_seconds))
            .with_freshness(Duration::from_secs(
                config.timeline.freshness_threshold_seconds,
            ))
    }

    pub fn with_segment_length(mut self, length: Duration) -> Self {
        self.segment_length = length;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn layout(&self) -> &RecordingLayout {
        &self.layout
    }

    pub fn build(&self, client_slug: &str, camera_name: &str) -> StorageResult<Timeline> {
        self.build_at(client_slug, camera_name, Utc::now())
    }

    pub fn build_at(
        &self,
        client_slug: &str,
        camera_name: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Timeline> {
        let Some(dir) = self.layout.resolve_dir(client_slug, camera_name) else {
            return Ok(Timeline::empty());
        };
        let folder = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut segments = self.scan(&dir, client_slug, &folder)?;
        segments.sort_by_key(|segment| segment.start_ms);

        let segment_ms = self.segment_length.as_millis() as i64;
        let count = segments.len();
        for index in 0..count.saturating_sub(1) {
            let next_start = segments[index + 1].start_ms;
            let segment = &mut segments[index];
            segment.end_ms = next_start;
            segment.duration_seconds = (next_start - segment.start_ms) as f64 / 1000.0;
            segment.is_recording = false;
        }

        if let Some(last) = segments.last_mut() {
            match std::fs::metadata(dir.join(&last.filename)).and_then(|meta| meta.modified()) {
                Ok(modified) => {
                    let modified_ms = system_time_ms(modified);
                    let now_ms = now.timestamp_millis();
                    let fresh = now_ms - modified_ms < self.freshness.as_millis() as i64;
                    let raw_end = if fresh { now_ms } else { modified_ms };
                    let duration_ms = (raw_end - last.start_ms).clamp(MIN_SEGMENT_MS, segment_ms);
                    last.is_recording = fresh;
                    last.end_ms = last.start_ms + duration_ms;
                    last.duration_seconds = duration_ms as f64 / 1000.0;
                }
                Err(err) => {
                    warn!(
                        file = %last.filename,
                        error = %err,
                        "cannot stat newest segment, assuming full length"
                    );
                    last.is_recording = false;
                    last.end_ms = last.start_ms + segment_ms;
                    last.duration_seconds = segment_ms as f64 / 1000.0;
                }
            }
        }

        Ok(Timeline::from_segments(segments))
    }

    fn scan(&self, dir: &Path, client_slug: &str, folder: &str) -> StorageResult<Vec<Segment>> {
        let entries = std::fs::read_dir(dir).map_err(|source| StorageError::Io {
            source,
            path: dir.to_path_buf(),
        })?;
        let default_ms = self.segment_length.as_millis() as i64;

        let mut segments = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            let is_segment = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(SEGMENT_EXTENSION));
            if !is_segment {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(start_ms) = parse_segment_start(&filename) else {
                debug!(file = %filename, "segment name does not carry a start time");
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot stat segment");
                    continue;
                }
            };
            let (created_at, modified_at) = file_times(&metadata);
            segments.push(Segment {
                path: format!("/live/{client_slug}/{folder}/{filename}"),
                filename,
                size: metadata.len(),
                start_ms,
                end_ms: start_ms + default_ms,
                duration_seconds: default_ms as f64 / 1000.0,
                is_recording: false,
                created_at,
                modified_at,
            });
        }
        Ok(segments)
    }
}

/// Start time in epoch milliseconds from `YYYY-MM-DD_HH-MM-SS.mp4`.
pub fn parse_segment_start(filename: &str) -> Option<i64> {
    let stem = Path::new(filename).file_stem()?.to_str()?;
    let naive = NaiveDateTime::parse_from_str(stem, FILENAME_FORMAT).ok()?;
    Some(naive.and_utc().timestamp_millis())
}

fn system_time_ms(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_millis()
}

fn file_times(metadata: &Metadata) -> (DateTime<Utc>, DateTime<Utc>) {
    let modified = metadata.modified().ok();
    let created = metadata.created().ok().or(modified);
    let to_utc = |time: Option<SystemTime>| time.map(DateTime::<Utc>::from).unwrap_or_default();
    (to_utc(created), to_utc(modified))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_utc_start_from_filename() {
        let ms = parse_segment_start("2025-10-27_19-41-28.mp4").unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 10, 27, 19, 41, 28).unwrap();
        assert_eq!(ms, expected.timestamp_millis());
        assert!(parse_segment_start("recording.mp4").is_none());
        assert!(parse_segment_start("2025-13-40_99-00-00.mp4").is_none());
    }

    #[test]
    fn missing_directory_yields_empty_timeline() {
        let temp = tempfile::TempDir::new().unwrap();
        let builder = TimelineBuilder::new(RecordingLayout::new(temp.path()));
        let timeline = builder.build("acme", "ghost").unwrap();
        assert_eq!(timeline, Timeline::empty());
        assert!(timeline.start_date.is_none());
    }
}
