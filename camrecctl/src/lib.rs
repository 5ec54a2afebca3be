use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use camrec_core::recorder::install_global;
use camrec_core::{
    build_orchestrator, build_recording_command, detect_once, load_camrec_config, CamrecConfig,
    CameraRegistry, CommandRequest, HardwareDetector, HardwareProfile, Protocol, PublishCallbacks,
    Reconciler, RecordingLayout, RecordingSettings, ResumeReport, SqliteRegistry, SyncReport,
    Timeline, TimelineBuilder,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::runtime::Runtime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] camrec_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry error: {0}")]
    Registry(#[from] camrec_core::RegistryError),
    #[error("storage error: {0}")]
    Storage(#[from] camrec_core::StorageError),
    #[error("media server error: {0}")]
    Reconcile(#[from] camrec_core::ReconcileError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("camera not found: {0}")]
    UnknownCamera(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera recording control interface", long_about = None)]
pub struct Cli {
    /// Path to camrec.toml
    #[arg(long, default_value = "configs/camrec.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the recording supervisor until interrupted
    Serve(ServeArgs),
    /// Registry cameras with their on-disk recording state
    Status,
    /// Reconstructs a camera's segment timeline
    Timeline(TimelineArgs),
    /// Rewrites the media server config from the registry and reloads it
    Sync,
    /// Detects the hardware encoder
    Hardware,
    /// Prints the recorder command line for a camera
    Command(CommandArgs),
    /// Runs basic checks
    Health,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Reconcile the media server before resuming recordings
    #[arg(long, default_value_t = false)]
    pub sync: bool,
    /// Read publish callback payloads from stdin, one JSON object per line.
    /// Recordings keep running after stdin closes, until ctrl-c
    #[arg(long, default_value_t = false)]
    pub callbacks_stdin: bool,
}

#[derive(Args, Debug)]
pub struct TimelineArgs {
    /// Client slug
    #[arg(long)]
    pub client: String,
    /// Camera name
    #[arg(long)]
    pub camera: String,
}

#[derive(Args, Debug)]
pub struct CommandArgs {
    /// Registry id of the camera
    #[arg(long)]
    pub camera_id: String,
    /// Encoder profile; `auto` runs detection
    #[arg(long, value_enum, default_value_t = EncoderChoice::Auto)]
    pub encoder: EncoderChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EncoderChoice {
    Auto,
    Nvenc,
    Vaapi,
    Software,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing(cli.log_level.as_deref());
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Serve(args) => {
            let summary = runtime()?.block_on(context.serve(args))?;
            render(&summary, cli.format)?;
        }
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Timeline(args) => {
            let timeline = context.timeline(args)?;
            render(&timeline, cli.format)?;
        }
        Commands::Sync => {
            let report = runtime()?.block_on(context.sync())?;
            render(&report, cli.format)?;
        }
        Commands::Hardware => {
            let profile = runtime()?.block_on(HardwareDetector::default().detect());
            render(&profile, cli.format)?;
        }
        Commands::Command(args) => {
            let preview = runtime()?.block_on(context.command_preview(args))?;
            render(&preview, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so `--format json` output stays parseable.
fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: CamrecConfig,
    config_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_camrec_config(&cli.config)?;
        Ok(Self {
            config,
            config_path: cli.config.clone(),
        })
    }

    fn open_registry(&self) -> Result<SqliteRegistry> {
        let path = &self.config.paths.registry_db;
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "registry database missing: {}",
                path.display()
            )));
        }
        Ok(SqliteRegistry::open(path)?)
    }

    async fn serve(&self, args: &ServeArgs) -> Result<ServeSummary> {
        let registry: Arc<dyn CameraRegistry> = Arc::new(self.open_registry()?);
        let profile = detect_once().await.clone();
        info!(encoder = %profile.encoder, "hardware profile ready");

        let orchestrator = Arc::new(build_orchestrator(&self.config, profile, None, None));
        let orchestrator = match install_global(orchestrator) {
            Ok(installed) => Arc::clone(installed),
            Err(orchestrator) => {
                warn!("global orchestrator already installed, continuing with a local one");
                orchestrator
            }
        };
        orchestrator.supervisor().spawn_monitor();

        if args.sync {
            match self.sync_with(registry.as_ref()).await {
                Ok(report) => info!(
                    cameras = report.cameras,
                    reload = %report.reload,
                    "media server reconciled"
                ),
                Err(err) => warn!(error = %err, "media server reconcile failed, continuing"),
            }
        }

        let resumed = orchestrator.resume_active(registry.as_ref()).await?;
        info!("recording supervisor running, ctrl-c to stop");

        if args.callbacks_stdin {
            let callbacks = PublishCallbacks::new(
                Arc::clone(&orchestrator),
                Arc::clone(&registry),
                &self.config.callbacks,
            );
            bridge_callbacks(
                &callbacks,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
                tokio::signal::ctrl_c(),
            )
            .await?;
        } else {
            tokio::signal::ctrl_c().await?;
        }

        let stopped = orchestrator.supervisor().tracked_cameras();
        orchestrator.stop_all().await;
        Ok(ServeSummary { resumed, stopped })
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let registry = self.open_registry()?;
        let builder = TimelineBuilder::from_config(&self.config);
        let mut cameras = Vec::new();
        for camera in registry.cameras()? {
            let timeline = match builder.build(&camera.client_slug, &camera.name) {
                Ok(timeline) => timeline,
                Err(err) => {
                    warn!(camera_id = %camera.id, error = %err, "cannot read recordings");
                    Timeline::empty()
                }
            };
            cameras.push(CameraStatusRow {
                recording: timeline
                    .segments
                    .last()
                    .is_some_and(|segment| segment.is_recording),
                segments: timeline.count,
                total_size: timeline.total_size,
                last_recorded: timeline.end_date,
                camera_id: camera.id,
                client: camera.client_slug,
                camera: camera.name,
                protocol: camera.protocol,
                active: camera.active,
                transcode: camera.transcode,
            });
        }
        Ok(StatusReport {
            recordings_root: self.config.paths.recordings_root.clone(),
            cameras,
        })
    }

    fn timeline(&self, args: &TimelineArgs) -> Result<Timeline> {
        let builder = TimelineBuilder::from_config(&self.config);
        Ok(builder.build(&args.client, &args.camera)?)
    }

    async fn sync(&self) -> Result<SyncReport> {
        let registry = self.open_registry()?;
        self.sync_with(&registry).await
    }

    async fn sync_with(&self, registry: &dyn CameraRegistry) -> Result<SyncReport> {
        let reconciler = Reconciler::new(&self.config.media_server, None)?;
        Ok(reconciler.full_reconcile(registry).await?)
    }

    async fn command_preview(&self, args: &CommandArgs) -> Result<CommandPreview> {
        let registry = self.open_registry()?;
        let camera = registry
            .camera(&args.camera_id)?
            .ok_or_else(|| AppError::UnknownCamera(args.camera_id.clone()))?;
        let profile = match args.encoder {
            EncoderChoice::Auto => HardwareDetector::default().detect().await,
            EncoderChoice::Nvenc => HardwareProfile::nvenc(),
            EncoderChoice::Vaapi => HardwareProfile::vaapi("/dev/dri/renderD128"),
            EncoderChoice::Software => HardwareProfile::software(),
        };

        let orchestrator = build_orchestrator(&self.config, profile.clone(), None, None);
        let source = orchestrator.source_for(&camera).ok_or_else(|| {
            AppError::MissingResource(format!("camera {} has no endpoint", camera.id))
        })?;
        let layout = RecordingLayout::new(&self.config.paths.recordings_root);
        let output_dir = layout.output_dir(&camera.client_slug, &camera.name, source.transcode);
        let command = build_recording_command(
            &CommandRequest {
                source_url: source.url,
                transcode: source.transcode,
                output_dir: output_dir.clone(),
                publish_target: source.publish_target,
            },
            &profile,
            &RecordingSettings::from(&self.config),
        );
        Ok(CommandPreview {
            camera_id: camera.id,
            encoder: profile.encoder,
            output_dir,
            command: command.redacted(),
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("camrec.toml", &self.config_path));
        results.push(self.check_directory("recordings_root", &self.config.paths.recordings_root));
        results.push(self.check_registry());
        results.push(self.check_ffmpeg());
        if let Some(parent) = self.config.media_server.config_path.parent() {
            results.push(self.check_directory("media server config dir", parent));
        }
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }

    fn check_registry(&self) -> HealthEntry {
        let name = "registry";
        let registry = match self.open_registry() {
            Ok(registry) => registry,
            Err(err) => return HealthEntry::error(name, err.to_string()),
        };
        match registry.ping() {
            Ok(count) => HealthEntry::ok(name, format!("{count} cameras")),
            Err(err) => HealthEntry::error(name, format!("query failed: {err}")),
        }
    }

    fn check_ffmpeg(&self) -> HealthEntry {
        let ffmpeg = &self.config.paths.ffmpeg;
        let status = Command::new(ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => HealthEntry::ok("ffmpeg", ffmpeg.display().to_string()),
            Ok(status) => HealthEntry::error("ffmpeg", format!("-version exited with {status}")),
            Err(err) => HealthEntry::error("ffmpeg", format!("{}: {err}", ffmpeg.display())),
        }
    }
}

/// Answers callback payloads until `shutdown` resolves. Closing the input
/// only stops the answers; recordings keep running until shutdown.
async fn bridge_callbacks<R, W, S>(
    callbacks: &PublishCallbacks,
    input: R,
    output: W,
    shutdown: S,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(shutdown);
    tokio::select! {
        result = serve_callbacks(callbacks, input, output) => {
            result?;
            info!("callback input closed, recording until shutdown");
        }
        signal = &mut shutdown => {
            signal?;
            return Ok(());
        }
    }
    shutdown.await?;
    Ok(())
}

/// Answers one callback payload per input line until the input closes.
async fn serve_callbacks<R, W>(callbacks: &PublishCallbacks, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = callbacks.dispatch(&line).await;
        let mut encoded = serde_json::to_vec(&reply)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ServeSummary {
    pub resumed: ResumeReport,
    pub stopped: Vec<String>,
}

impl DisplayFallback for ServeSummary {
    fn display(&self) -> String {
        format!(
            "resumed {} cameras ({} failed, {} skipped), stopped {}",
            self.resumed.started.len(),
            self.resumed.failed.len(),
            self.resumed.skipped.len(),
            self.stopped.len()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub recordings_root: PathBuf,
    pub cameras: Vec<CameraStatusRow>,
}

#[derive(Debug, Serialize)]
pub struct CameraStatusRow {
    pub camera_id: String,
    pub client: String,
    pub camera: String,
    pub protocol: Protocol,
    pub active: bool,
    pub transcode: bool,
    /// Newest segment is still being written.
    pub recording: bool,
    pub segments: usize,
    pub total_size: u64,
    pub last_recorded: Option<DateTime<Utc>>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        if self.cameras.is_empty() {
            return "No cameras registered".to_string();
        }
        let mut lines = vec![format!("Recordings: {}", self.recordings_root.display())];
        for row in &self.cameras {
            let state = match (row.active, row.recording) {
                (_, true) => "recording",
                (true, false) => "idle",
                (false, false) => "inactive",
            };
            let last = row
                .last_recorded
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "{client}/{camera} [{protocol}{mode}] {state} segments={segments} last={last}",
                client = row.client,
                camera = row.camera,
                protocol = row.protocol,
                mode = if row.transcode { ", h265" } else { "" },
                segments = row.segments,
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Timeline {
    fn display(&self) -> String {
        if self.segments.is_empty() {
            return "No segments".to_string();
        }
        let mut lines = vec![format!(
            "{} segments, {:.1} s, {} bytes",
            self.count, self.total_duration_seconds, self.total_size
        )];
        for segment in &self.segments {
            lines.push(format!(
                "{name} {duration:>6.1}s {size:>10}{live}",
                name = segment.filename,
                duration = segment.duration_seconds,
                size = segment.size,
                live = if segment.is_recording { " [REC]" } else { "" },
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SyncReport {
    fn display(&self) -> String {
        let mut line = format!(
            "{} paths written to {} (reload: {})",
            self.cameras,
            self.config_path.display(),
            self.reload
        );
        if !self.skipped.is_empty() {
            line.push_str(&format!("\nskipped: {}", self.skipped.join(", ")));
        }
        line
    }
}

impl DisplayFallback for HardwareProfile {
    fn display(&self) -> String {
        let device = self
            .device
            .as_ref()
            .map(|device| format!(" device={}", device.display()))
            .unwrap_or_default();
        format!(
            "encoder={} preset={} hardware={}{}",
            self.encoder,
            self.preset,
            self.is_hardware(),
            device
        )
    }
}

#[derive(Debug, Serialize)]
pub struct CommandPreview {
    pub camera_id: String,
    pub encoder: String,
    pub output_dir: PathBuf,
    pub command: String,
}

impl DisplayFallback for CommandPreview {
    fn display(&self) -> String {
        self.command.clone()
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}
