//! Configuration management for the vidcap agent
//!
//! The configuration is a TOML file under the agent home directory. It is
//! loaded once per process; the controller watches its content hash and asks
//! for a restart when the file changes.

use anyhow::{bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::logger::LogLevel;

pub const AUTO: &str = "auto";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Serial number of the capture channel to record, or "auto" for the first one found
    #[serde(default = "default_auto")]
    pub device_serial_number: String,

    /// Glob pattern of the device nodes to scan
    #[serde(default = "default_video_device_path_pattern")]
    pub video_device_path_pattern: String,

    /// Tag embedded into each recording, "auto" derives one from host and device
    #[serde(default = "default_auto")]
    pub instance_tag: String,

    #[serde(default = "default_true")]
    pub session_logger_enabled: bool,

    #[serde(default)]
    pub session_logger_level: LogLevel,

    /// chrono format used for session log timestamps
    #[serde(default = "default_session_logger_pattern")]
    pub session_logger_pattern: String,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub ffm_opts: FfmOpts,

    #[serde(default)]
    pub conduct_opts: ConductOpts,

    #[serde(default)]
    pub ext_proc_opts: ExtProcOpts,

    #[serde(default)]
    pub notify_opts: NotifyOpts,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Delay between two signal samples (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Recorder silence after which the session is restarted (ms)
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    /// Pause after a session start before the next sample (ms)
    #[serde(default = "default_start_settle")]
    pub start_settle_ms: u64,

    /// Device family name used when no serial number is configured
    #[serde(default = "default_channel_family")]
    pub channel_family: String,
}

/// Fragments of the ffmpeg command line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmOpts {
    pub a_fmt: String,
    pub a_nchan: String,
    pub a_opt: String,
    /// ALSA input, "auto" or "auto,<subdevice>" to look it up by bus
    pub a_dev: String,
    pub v_fmt: String,
    pub v_opt: String,
    /// Video node, "auto" to use the sampled channel's node
    pub v_dev: String,
    pub v_enc: String,
    pub pix_fmt: String,
    pub n_threads: String,
    pub a_enc: String,
    /// Container extension
    pub out_fmt: String,
}

/// con/duct resource monitor wrapping the recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductOpts {
    pub enabled: bool,
    /// Template with {duct_bin}, {start_ts}, {prefix} and {ffmpeg_cmd}
    pub cmd: String,
    pub duct_bin: String,
}

/// External process run alongside every session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtProcOpts {
    pub enabled: bool,
    pub status_command: String,
    pub status_delay_ms: u64,
    pub status_regex: String,
    pub exec_command: String,
    pub exec_restart_on_exit: bool,
}

/// REST notification endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyOpts {
    pub enabled: bool,
    pub api_base_url: String,
    /// Literal key or "${ENV_VAR}"
    pub api_key: String,
    pub verify_ssl_cert: bool,
    pub data_provider_id: i64,
    pub device_id: i64,
    pub message_category_id: i64,
    /// Messages below this level are not sent
    pub message_level_id: i64,
    pub study: String,
    pub timeout_ms: u64,
}

// Default value functions
fn default_auto() -> String {
    AUTO.to_string()
}

fn default_true() -> bool {
    true
}

fn default_video_device_path_pattern() -> String {
    "/dev/video*".to_string()
}

fn default_session_logger_pattern() -> String {
    "%Y-%m-%d %H:%M:%S%.3f".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_recovery_timeout() -> u64 {
    60_000
}

fn default_start_settle() -> u64 {
    5000
}

fn default_channel_family() -> String {
    "USB Capture".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_serial_number: default_auto(),
            video_device_path_pattern: default_video_device_path_pattern(),
            instance_tag: default_auto(),
            session_logger_enabled: true,
            session_logger_level: LogLevel::default(),
            session_logger_pattern: default_session_logger_pattern(),
            capture: CaptureConfig::default(),
            ffm_opts: FfmOpts::default(),
            conduct_opts: ConductOpts::default(),
            ext_proc_opts: ExtProcOpts::default(),
            notify_opts: NotifyOpts::default(),
            config_path: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            recovery_timeout_ms: default_recovery_timeout(),
            start_settle_ms: default_start_settle(),
            channel_family: default_channel_family(),
        }
    }
}

impl Default for FfmOpts {
    fn default() -> Self {
        Self {
            a_fmt: "-f alsa".to_string(),
            a_nchan: "-ac 2".to_string(),
            a_opt: "-thread_queue_size 4096".to_string(),
            a_dev: AUTO.to_string(),
            v_fmt: "-f v4l2".to_string(),
            v_opt: "-thread_queue_size 4096".to_string(),
            v_dev: AUTO.to_string(),
            v_enc: "-c:v libx264 -preset ultrafast -crf 18".to_string(),
            pix_fmt: "-pix_fmt yuv420p".to_string(),
            n_threads: "-threads 4".to_string(),
            a_enc: "-c:a aac -b:a 128k".to_string(),
            out_fmt: "mkv".to_string(),
        }
    }
}

impl Default for ConductOpts {
    fn default() -> Self {
        Self {
            enabled: false,
            cmd: "{duct_bin} --sample-interval 0.5 --report-interval 60 -p {prefix} {ffmpeg_cmd}"
                .to_string(),
            duct_bin: "duct".to_string(),
        }
    }
}

impl Default for NotifyOpts {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base_url: String::new(),
            api_key: String::new(),
            verify_ssl_cert: true,
            data_provider_id: 0,
            device_id: 0,
            message_category_id: 0,
            message_level_id: 0,
            study: String::new(),
            timeout_ms: 3000,
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }
}

impl Config {
    /// Load configuration from `path`. A missing file is an error: the agent
    /// has nothing sensible to record without one.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                let yaml = path.with_extension("yaml");
                if yaml.exists() {
                    bail!(
                        "Failed to read config file {:?}: {}; found {:?}, convert it to TOML",
                        path,
                        e,
                        yaml
                    );
                }
                return Err(e).with_context(|| format!("Failed to read config file: {:?}", path));
            }
        };
        let mut config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.normalize()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.device_serial_number.trim().is_empty() {
            self.device_serial_number = default_auto();
        }
        if self.capture.poll_interval_ms == 0 {
            bail!("capture.poll_interval_ms must be greater than zero");
        }
        if self.ffm_opts.out_fmt.trim().is_empty() {
            bail!("ffm_opts.out_fmt must not be empty");
        }
        if StrftimeItems::new(&self.session_logger_pattern).any(|item| item == Item::Error) {
            bail!(
                "Invalid session_logger_pattern: {:?}",
                self.session_logger_pattern
            );
        }
        if self.ext_proc_opts.enabled && !self.ext_proc_opts.status_regex.is_empty() {
            regex::Regex::new(&self.ext_proc_opts.status_regex)
                .context("Invalid ext_proc_opts.status_regex")?;
        }
        self.notify_opts.api_key = expand_env(&self.notify_opts.api_key)?;
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// `None` when a serial of "auto" selects the first channel of the family.
    pub fn target_serial(&self) -> Option<&str> {
        match self.device_serial_number.as_str() {
            AUTO => None,
            serial => Some(serial),
        }
    }

    /// Configured tag, or `hash(app)-hash(serial)-hash(home)`.
    pub fn resolve_instance_tag(&self, app_name: &str, home: &Path) -> String {
        if self.instance_tag != AUTO && !self.instance_tag.is_empty() {
            return self.instance_tag.clone();
        }
        let home = std::fs::canonicalize(home).unwrap_or_else(|_| home.to_path_buf());
        format!(
            "{:08x}-{:08x}-{:08x}",
            fnv1a_32(app_name.as_bytes()),
            fnv1a_32(self.device_serial_number.as_bytes()),
            fnv1a_32(home.to_string_lossy().as_bytes())
        )
    }
}

/// `${NAME}` is replaced with the environment variable NAME.
fn expand_env(value: &str) -> Result<String> {
    let trimmed = value.trim();
    let Some(name) = trimmed.strip_prefix("${").and_then(|v| v.strip_suffix('}')) else {
        return Ok(value.to_string());
    };
    std::env::var(name).with_context(|| format!("Environment variable {} is not set", name))
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(0x0100_0193)
    })
}

/// SHA-256 of the file contents, hex encoded.
pub fn file_hash(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read config file: {:?}", path))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
