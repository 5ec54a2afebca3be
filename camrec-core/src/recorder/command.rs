use std::path::{Path, PathBuf};

use serde::Serialize;
use url::Url;

use crate::config::CamrecConfig;
use crate::hardware::{Accelerator, HardwareProfile};

const SEGMENT_PATTERN: &str = "%Y-%m-%d_%H-%M-%S.mp4";
const MOV_FLAGS: &str = "movflags=+faststart+frag_keyframe+empty_moov";

/// Encoding policy shared by every recording command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSettings {
    pub ffmpeg: PathBuf,
    pub segment_seconds: u64,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub log_level: String,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            segment_seconds: 120,
            video_bitrate: "2M".into(),
            audio_bitrate: "128k".into(),
            log_level: "warning".into(),
        }
    }
}

impl From<&CamrecConfig> for RecordingSettings {
    fn from(config: &CamrecConfig) -> Self {
        Self {
            ffmpeg: config.paths.ffmpeg.clone(),
            segment_seconds: config.recording.segment_seconds,
            video_bitrate: config.recording.video_bitrate.clone(),
            audio_bitrate: config.recording.audio_bitrate.clone(),
            log_level: config.recording.log_level.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub source_url: String,
    pub transcode: bool,
    pub output_dir: PathBuf,
    /// Live re-stream target for authenticated pull sources.
    pub publish_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RecordingCommand {
    /// Command line with URL credentials masked, safe to log.
    pub fn redacted(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|arg| redact_url(arg)));
        parts.join(" ")
    }
}

fn redact_url(value: &str) -> String {
    let Ok(mut url) = Url::parse(value) else {
        return value.to_string();
    };
    if url.username().is_empty() && url.password().is_none() {
        return value.to_string();
    }
    if url.set_username("***").is_err() || url.set_password(Some("***")).is_err() {
        return value.to_string();
    }
    url.to_string()
}

fn is_pull_source(source: &str) -> bool {
    source.starts_with("rtsp://") || source.starts_with("rtsps://")
}

fn has_credentials(source: &str) -> bool {
    Url::parse(source)
        .map(|url| !url.username().is_empty() || url.password().is_some())
        .unwrap_or(false)
}

/// "2M" -> "4M", "1500k" -> "3000k". Unparseable values are passed through.
fn double_rate(rate: &str) -> String {
    let split = rate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rate.len());
    let (digits, suffix) = rate.split_at(split);
    match digits.parse::<u64>() {
        Ok(value) => format!("{}{}", value * 2, suffix),
        Err(_) => rate.to_string(),
    }
}

fn push<I, S>(args: &mut Vec<String>, items: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.extend(items.into_iter().map(Into::into));
}

fn push_segment_output(args: &mut Vec<String>, settings: &RecordingSettings, output_dir: &Path) {
    push(
        args,
        [
            "-f".to_string(),
            "segment".into(),
            "-segment_time".into(),
            settings.segment_seconds.to_string(),
            "-segment_format".into(),
            "mp4".into(),
            "-segment_format_options".into(),
            MOV_FLAGS.into(),
            "-reset_timestamps".into(),
            "1".into(),
            "-strftime".into(),
            "1".into(),
            output_dir.join(SEGMENT_PATTERN).display().to_string(),
        ],
    );
}

fn push_copy_video(args: &mut Vec<String>, settings: &RecordingSettings) {
    push(
        args,
        [
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            "-b:a",
            settings.audio_bitrate.as_str(),
        ],
    );
}

/// Builds the recorder command line. Same inputs always give the same
/// argument list; nothing here touches the filesystem or the network.
pub fn build_recording_command(
    request: &CommandRequest,
    profile: &HardwareProfile,
    settings: &RecordingSettings,
) -> RecordingCommand {
    let mut args = Vec::with_capacity(48);
    push(
        &mut args,
        [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            settings.log_level.as_str(),
            "-y",
        ],
    );

    if request.transcode {
        match profile.accelerator {
            Accelerator::Nvenc => push(&mut args, ["-hwaccel", "cuda", "-hwaccel_device", "0"]),
            Accelerator::Vaapi => {
                let device = profile
                    .device
                    .as_deref()
                    .unwrap_or_else(|| Path::new("/dev/dri/renderD128"));
                push(
                    &mut args,
                    [
                        "-vaapi_device".to_string(),
                        device.display().to_string(),
                        "-hwaccel".into(),
                        "vaapi".into(),
                    ],
                );
            }
            Accelerator::Software => {}
        }
    }

    if is_pull_source(&request.source_url) {
        push(&mut args, ["-rtsp_transport", "tcp"]);
    }
    push(&mut args, ["-i", request.source_url.as_str()]);

    if request.transcode {
        let buffer = double_rate(&settings.video_bitrate);
        push(
            &mut args,
            [
                "-c:v",
                profile.encoder.as_str(),
                "-preset",
                profile.preset.as_str(),
                "-b:v",
                settings.video_bitrate.as_str(),
                "-maxrate",
                settings.video_bitrate.as_str(),
                "-bufsize",
                buffer.as_str(),
                "-c:a",
                "aac",
                "-b:a",
                settings.audio_bitrate.as_str(),
            ],
        );
        push_segment_output(&mut args, settings, &request.output_dir);
    } else {
        let restream = request
            .publish_target
            .as_deref()
            .filter(|_| is_pull_source(&request.source_url) && has_credentials(&request.source_url));
        if let Some(target) = restream {
            push_copy_video(&mut args, settings);
            push(&mut args, ["-f", "rtsp", "-rtsp_transport", "tcp", target]);
        }
        push_copy_video(&mut args, settings);
        push_segment_output(&mut args, settings, &request.output_dir);
    }

    RecordingCommand {
        program: settings.ffmpeg.clone(),
        args,
    }
}
