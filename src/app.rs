//! Process bootstrap: configuration, host checks, wiring and exit codes

use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::audio;
use crate::capture::v4l2::{self, V4l2Device};
use crate::config::{Config, CONFIG_FILE_NAME};
use crate::controller::{ControllerSettings, RunOutcome, SessionController};
use crate::notifications::{notification_queue, LogSink, Message, NotificationSink, RestSink};
use crate::recorder::expand_output_path;
use crate::recorder::ext_proc;
use crate::recorder::process::ShellLauncher;
use crate::shutdown::{install_ctrlc, ShutdownSignal};

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 64;
pub const EXIT_UNAVAILABLE: i32 = 69;
pub const EXIT_CANTCREAT: i32 = 73;
pub const EXIT_CONFIG: i32 = 78;
/// Operator interrupt
pub const EXIT_SYS_BREAK: i32 = 140;
/// The config file changed; the process re-executes itself
pub const EXIT_CONFIG_RELOAD: i32 = 141;

const REQUIRED_TOOLS: [&str; 2] = ["ffmpeg", "v4l2-ctl"];
const NOTIFY_DRAIN: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("cannot create output directory {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => EXIT_CONFIG,
            StartupError::MissingTool(_) => EXIT_UNAVAILABLE,
            StartupError::Output { .. } => EXIT_CANTCREAT,
        }
    }
}

/// What the command line selected for a capture run
#[derive(Debug, Clone)]
pub struct Options {
    pub home: PathBuf,
    pub output: Option<String>,
    pub config: Option<PathBuf>,
    pub top_log: bool,
}

impl Options {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.home.join(CONFIG_FILE_NAME))
    }

    pub fn output_template(&self) -> String {
        self.output
            .clone()
            .unwrap_or_else(|| format!("{}/Videos/{{year}}/{{month}}", self.home.display()))
    }
}

pub fn load_config(path: &Path) -> Result<Config, StartupError> {
    let config = Config::load(path).map_err(StartupError::Config)?;
    info!("Configuration loaded from {:?}", path);
    Ok(config)
}

/// The output directory for a session starting now must be creatable.
pub fn check_output(template: &str) -> Result<PathBuf, StartupError> {
    let path = expand_output_path(template, &Local::now());
    std::fs::create_dir_all(&path).map_err(|source| StartupError::Output {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn tool_available(name: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {}", name))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Host tools the recorder and device inspection shell out to.
pub fn check_system(config: &Config) -> Result<(), StartupError> {
    for tool in REQUIRED_TOOLS {
        if !tool_available(tool) {
            return Err(StartupError::MissingTool(tool.to_string()));
        }
    }

    if config.conduct_opts.enabled {
        let duct = &config.conduct_opts.duct_bin;
        let output = Command::new(duct)
            .arg("--version")
            .output()
            .map_err(|_| StartupError::MissingTool(duct.clone()))?;
        if !output.status.success() {
            return Err(StartupError::MissingTool(duct.clone()));
        }
        info!(
            "con/duct: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
    }
    Ok(())
}

fn notification_sink(config: &Config) -> Result<Box<dyn NotificationSink>> {
    if !config.notify_opts.enabled {
        return Ok(Box::new(LogSink));
    }
    let sink = RestSink::new(&config.notify_opts)?;
    info!("Sending notifications to {}", config.notify_opts.api_base_url);
    Ok(Box::new(sink))
}

/// Run the capture loop until interrupted. Returns the process exit code.
pub fn run(opts: &Options) -> i32 {
    match run_capture(opts) {
        Ok(RunOutcome::Interrupted) => EXIT_SYS_BREAK,
        Ok(RunOutcome::ConfigReload) => EXIT_CONFIG_RELOAD,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

fn run_capture(opts: &Options) -> Result<RunOutcome, StartupError> {
    let config_path = opts.config_path();
    let config = Arc::new(load_config(&config_path)?);

    let template = opts.output_template();
    let out_dir = check_output(&template)?;
    info!("Recording to {}", out_dir.display());
    check_system(&config)?;

    let sink = notification_sink(&config).map_err(StartupError::Config)?;
    let queue = notification_queue(sink, config.notify_opts.message_level_id);
    if let Err(e) = queue.start() {
        warn!("Notifications disabled: {}", e);
    }
    let notifier = queue.sender();

    let shutdown = ShutdownSignal::new();
    if let Err(e) = install_ctrlc(shutdown.clone()) {
        warn!("{:#}", e);
    }

    let settings =
        ControllerSettings::from_config(&config, APP_NAME, &opts.home, &template, opts.top_log);
    info!("Instance tag: {}", settings.instance_tag);
    let device = V4l2Device::new(config.video_device_path_pattern.clone());
    let mut controller = SessionController::new(
        config.clone(),
        settings,
        device,
        Arc::new(ShellLauncher),
        notifier.clone(),
        shutdown,
    )
    .map_err(StartupError::Config)?;
    let watched = config.config_path().unwrap_or(config_path.as_path());
    if let Err(e) = controller.watch_config(watched) {
        warn!("Config changes will not be detected: {:#}", e);
    }

    notifier.push(Message::info(format!(
        "{} {} started",
        APP_NAME,
        env!("CARGO_PKG_VERSION")
    )));
    let outcome = controller.run();
    drop(controller);

    let reason = match outcome {
        RunOutcome::Interrupted => "stopped",
        RunOutcome::ConfigReload => "reloading configuration",
    };
    notifier.push(Message::info(format!("{} {}", APP_NAME, reason)));
    let deadline = Instant::now() + NOTIFY_DRAIN;
    while queue.is_running() && !queue.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if let Err(e) = queue.stop() {
        warn!("{}", e);
    }
    Ok(outcome)
}

/// `--list-devices`: print video capture nodes and/or ALSA cards.
pub fn list_devices(mode: &str, config: Option<&Config>) -> Result<()> {
    let (video, sound) = match mode {
        "all" => (true, true),
        "video" => (true, false),
        "audio" => (false, true),
        other => anyhow::bail!("Invalid list mode: {}, must be 'all', 'audio' or 'video'", other),
    };
    let defaults = Config::default();
    let config = config.unwrap_or(&defaults);

    if video {
        println!("Video devices ({}):", config.video_device_path_pattern);
        for (path, info) in v4l2::list_video_devices(&config.video_device_path_pattern) {
            println!(
                "  {:<14} {} [serial: {}] [bus: {}] [driver: {}]",
                path, info.card, info.serial, info.bus_info, info.driver
            );
        }
    }
    if sound {
        println!("Audio devices:");
        for card in audio::read_cards() {
            println!(
                "  hw:{},0  {} [{}] {}",
                card.index, card.name, card.driver, card.long_name
            );
        }
    }
    Ok(())
}

/// `--ext-proc`: run the external process checks from the config file.
pub fn check_ext_proc(config_path: &Path, mode: &str) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };
    match ext_proc::check(&config.ext_proc_opts, mode).context("External process check failed") {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("{:#}", e);
            EXIT_USAGE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(home: &Path) -> Options {
        Options {
            home: home.to_path_buf(),
            output: None,
            config: None,
            top_log: false,
        }
    }

    #[test]
    fn test_default_paths() {
        let opts = options(Path::new("/home/rig/.vidcap"));
        assert_eq!(opts.config_path(), PathBuf::from("/home/rig/.vidcap/config.toml"));
        assert_eq!(opts.output_template(), "/home/rig/.vidcap/Videos/{year}/{month}");

        let custom = Options {
            output: Some("/data/{year}".to_string()),
            config: Some(PathBuf::from("/etc/vidcap.toml")),
            ..opts
        };
        assert_eq!(custom.config_path(), PathBuf::from("/etc/vidcap.toml"));
        assert_eq!(custom.output_template(), "/data/{year}");
    }

    #[test]
    fn test_check_output_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/Videos/{{year}}/{{month}}", dir.path().display());
        let created = check_output(&template).unwrap();
        assert!(created.is_dir());
        assert!(created.starts_with(dir.path().join("Videos")));
    }

    #[test]
    fn test_check_output_failure_maps_to_cantcreat() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let err = check_output(&format!("{}/sub", blocker.display())).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_CANTCREAT);
    }

    #[test]
    fn test_missing_config_maps_to_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        assert_eq!(run(&opts), EXIT_CONFIG);
    }

    #[test]
    fn test_missing_duct_is_unavailable() {
        let mut config = Config::default();
        config.conduct_opts.enabled = true;
        config.conduct_opts.duct_bin = "/nonexistent/duct".to_string();
        let err = check_system(&config).unwrap_err();
        assert!(matches!(err, StartupError::MissingTool(_)));
        assert_eq!(err.exit_code(), EXIT_UNAVAILABLE);
    }

    #[test]
    fn test_tool_lookup() {
        assert!(tool_available("sh"));
        assert!(!tool_available("vidcap-no-such-tool"));
    }

    #[test]
    fn test_ext_proc_check_without_config() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(check_ext_proc(&dir.path().join("missing.toml"), "all"), EXIT_CONFIG);
    }
}
