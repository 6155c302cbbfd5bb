//! Capture session state machine
//!
//! Every tick samples the target channel and decides whether a recording
//! session has to start, stop, or restart:
//!
//! | state     | sample                              | action                         |
//! |-----------|-------------------------------------|--------------------------------|
//! | any       | target reported gone by hot-plug    | stop, forget the target        |
//! | any       | no channel / device error           | stop (no-op when idle)         |
//! | idle      | capturable                          | start                          |
//! | recording | capturable, different from previous | stop, start again next tick    |
//! | recording | not capturable                      | stop                           |
//! | recording | unchanged, recorder silent too long | stop, start with auto recovery |
//!
//! After the sample the config file hash is compared with the one seen at
//! startup; a change stops the session and ends the loop so the process can
//! reload.

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio;
use crate::capture::{
    v4l2, CaptureDevice, DeviceError, DeviceIdentity, DisconnectedDevices, HotplugEvent,
    SignalSampler, SignalSnapshot,
};
use crate::config::{file_hash, Config, AUTO};
use crate::notifications::{Message, MessageLevel, Notifier};
use crate::recorder::ext_proc::{compile_status_regex, ExtProcBody};
use crate::recorder::process::{ProcessLauncher, ProcessSlot, TerminationPolicy};
use crate::recorder::session::{Heartbeat, RecordingBody, SessionFiles, SessionFinalizer};
use crate::recorder::{build_ffmpeg_command, expand_macros, expand_output_path, RecorderInput};
use crate::session::metadata::{log_record, Record};
use crate::session::{iso_str, time_str, SessionLogger};
use crate::shutdown::ShutdownSignal;
use crate::worker::{SingleSlotScheduler, Worker};

/// Passed to the recorder when no video node could be resolved, so the
/// failure shows up in the session log instead of silently recording nothing.
const VIDEO_DEVICE_NOT_FOUND: &str = "/dev/video_not_found";
const AUDIO_DEVICE_FALLBACK: &str = "default";

const STOP_NO_CHANNEL: &str = ":\tStopped recording. No channels!";
const STOP_CHANGED: &str = ":\tStopped recording because something changed.";
const STOP_STALLED: &str = ":\tRecorder stalled, restarting.";
const STOP_CONFIG: &str = ":\tConfiguration changed, reloading.";
const FINALIZE_UNFINISHED: &str = ":\tFound still unfinished video file, fixing it.";

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    ConfigChanged,
}

/// Why [`SessionController::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Interrupted,
    ConfigReload,
}

/// Everything the controller needs besides the config file itself.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub app_name: String,
    /// Output directory template with `{year}` and `{month}`
    pub output_template: String,
    pub instance_tag: String,
    pub poll_interval: Duration,
    pub recovery_timeout: Duration,
    pub start_settle: Duration,
    pub recorder_policy: TerminationPolicy,
    pub companion_policy: TerminationPolicy,
    /// Echo recorder output to the main log
    pub echo_output: bool,
}

impl ControllerSettings {
    pub fn from_config(
        config: &Config,
        app_name: &str,
        home: &Path,
        output_template: &str,
        echo_output: bool,
    ) -> Self {
        Self {
            app_name: app_name.to_string(),
            output_template: output_template.to_string(),
            instance_tag: config.resolve_instance_tag(app_name, home),
            poll_interval: config.capture.poll_interval(),
            recovery_timeout: config.capture.recovery_timeout(),
            start_settle: config.capture.start_settle(),
            recorder_policy: TerminationPolicy::recorder(),
            companion_policy: TerminationPolicy::companion(),
            echo_output,
        }
    }
}

struct ConfigWatch {
    path: PathBuf,
    hash: String,
}

/// The session currently recording
struct ActiveSession {
    snapshot: SignalSnapshot,
    auto_recovery: bool,
    heartbeat: Arc<Heartbeat>,
    recorder: Arc<ProcessSlot>,
    companion: Option<Arc<ProcessSlot>>,
    logger: Arc<SessionLogger>,
    finalizer: Arc<SessionFinalizer>,
}

impl ActiveSession {
    fn files(&self) -> &SessionFiles {
        self.finalizer.files()
    }
}

pub struct SessionController<D: CaptureDevice> {
    config: Arc<Config>,
    settings: ControllerSettings,
    sampler: SignalSampler<D>,
    launcher: Arc<dyn ProcessLauncher>,
    notifier: Notifier,
    shutdown: ShutdownSignal,
    disconnected: DisconnectedDevices,
    recordings: SingleSlotScheduler,
    companions: SingleSlotScheduler,
    status_regex: Option<Regex>,
    config_watch: Option<ConfigWatch>,
    previous: Option<SignalSnapshot>,
    target: Option<DeviceIdentity>,
    active: Option<ActiveSession>,
    last_error: Option<String>,
    last_stop_reason: Option<String>,
}

impl<D: CaptureDevice> SessionController<D> {
    pub fn new(
        config: Arc<Config>,
        settings: ControllerSettings,
        device: D,
        launcher: Arc<dyn ProcessLauncher>,
        notifier: Notifier,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let status_regex = if config.ext_proc_opts.enabled {
            compile_status_regex(&config.ext_proc_opts.status_regex)?
        } else {
            None
        };
        let sampler = SignalSampler::new(device, config.capture.channel_family.clone());
        Ok(Self {
            config,
            settings,
            sampler,
            launcher,
            notifier,
            shutdown,
            disconnected: DisconnectedDevices::default(),
            recordings: SingleSlotScheduler::new("recording"),
            companions: SingleSlotScheduler::new("ext-proc"),
            status_regex,
            config_watch: None,
            previous: None,
            target: None,
            active: None,
            last_error: None,
            last_stop_reason: None,
        })
    }

    /// Remember the current hash of `path`; a later change ends [`Self::run`].
    pub fn watch_config(&mut self, path: &Path) -> Result<()> {
        let hash = file_hash(path)?;
        debug!("Watching config {} ({})", path.display(), hash);
        self.config_watch = Some(ConfigWatch {
            path: path.to_path_buf(),
            hash,
        });
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_auto_recovery(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.auto_recovery)
    }

    pub fn last_stop_reason(&self) -> Option<&str> {
        self.last_stop_reason.as_deref()
    }

    pub fn target(&self) -> Option<&DeviceIdentity> {
        self.target.as_ref()
    }

    /// Hot-plug events mark device paths as gone or back and are forwarded
    /// as notifications.
    pub fn register_hotplug(&mut self) -> Result<(), DeviceError> {
        let disconnected = self.disconnected.clone();
        let notifier = self.notifier.clone();
        let app_name = self.settings.app_name.clone();
        self.sampler
            .device_mut()
            .register_hotplug(Box::new(move |event| match event {
                HotplugEvent::Arrived(path) => {
                    info!("Device connected: {}", path);
                    disconnected.mark_arrived(&path);
                    notifier.push(Message::info(format!("{} device connected: {}", app_name, path)));
                }
                HotplugEvent::Left(path) => {
                    warn!("Device disconnected: {}", path);
                    disconnected.mark_left(&path);
                    notifier.push(Message::new(
                        MessageLevel::Warning,
                        format!("{} device disconnected: {}", app_name, path),
                    ));
                }
            }))
    }

    /// Poll until shutdown is requested or the config file changes.
    pub fn run(&mut self) -> RunOutcome {
        if let Err(e) = self.register_hotplug() {
            warn!("Hot-plug notifications unavailable: {}", e);
        }
        info!(
            "Watching for capturable signal every {:?}",
            self.settings.poll_interval
        );

        let outcome = loop {
            if self.shutdown.is_requested() {
                self.stop_session("Program terminated");
                break RunOutcome::Interrupted;
            }
            if self.poll_once() == Tick::ConfigChanged {
                break RunOutcome::ConfigReload;
            }
            self.shutdown.sleep(self.settings.poll_interval);
        };

        self.recordings.shutdown();
        self.companions.shutdown();
        outcome
    }

    pub fn poll_once(&mut self) -> Tick {
        if self.target_disconnected() {
            if let Some(target) = self.target.take() {
                self.stop_session(&format!("Target device {} disconnected", target.path));
            }
            self.previous = None;
        } else {
            match self.sampler.sample(self.config.target_serial()) {
                Ok((snapshot, identity)) => {
                    self.last_error = None;
                    self.on_sample(snapshot, identity);
                }
                Err(e) => {
                    let text = e.to_string();
                    if self.last_error.as_deref() != Some(text.as_str()) {
                        warn!("{}", text);
                        self.last_error = Some(text);
                    }
                    self.stop_session(STOP_NO_CHANNEL);
                    self.previous = None;
                }
            }
        }

        if self.config_changed() {
            self.stop_session(STOP_CONFIG);
            return Tick::ConfigChanged;
        }
        Tick::Continue
    }

    fn target_disconnected(&self) -> bool {
        self.target
            .as_ref()
            .is_some_and(|t| self.disconnected.contains(&t.path))
    }

    fn on_sample(&mut self, snapshot: SignalSnapshot, identity: DeviceIdentity) {
        self.target = Some(identity);

        if snapshot.is_capturable() {
            if self.active.is_none() {
                if let Err(e) = self.start_session(snapshot, false) {
                    error!("Failed to start recording: {:#}", e);
                }
            } else if self.previous != Some(snapshot) {
                self.stop_session(STOP_CHANGED);
            } else {
                self.check_recovery();
            }
        } else if self.active.is_some() {
            self.stop_session(&format!(
                ":\tWhack resolution: {}x{}. Stopped recording",
                snapshot.cx, snapshot.cy
            ));
        } else {
            debug!("Signal not capturable: {}", snapshot);
        }

        self.previous = Some(snapshot);
    }

    fn check_recovery(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if self.shutdown.is_requested() {
            return;
        }
        let age = active.heartbeat.age();
        if age <= self.settings.recovery_timeout {
            return;
        }

        let worker_alive = self
            .recordings
            .current()
            .is_some_and(|w| w.is_running());
        warn!(
            "Recorder silent for {:?} (worker running: {}), restarting session",
            age, worker_alive
        );
        let snapshot = active.snapshot;
        self.stop_session(STOP_STALLED);
        if let Err(e) = self.start_session(snapshot, true) {
            error!("Failed to restart recording: {:#}", e);
        }
    }

    fn resolve_video_device(&self, identity: &DeviceIdentity) -> String {
        let configured = self.config.ffm_opts.v_dev.trim();
        if configured != AUTO && !configured.is_empty() {
            return configured.to_string();
        }
        if let Some(path) = &identity.video_path {
            return path.clone();
        }
        if !identity.serial.is_empty() {
            if let Some(path) =
                v4l2::video_device_path_by_serial(&self.config.video_device_path_pattern, &identity.serial)
            {
                return path;
            }
        }
        error!("No video node found for device {}", identity.serial);
        VIDEO_DEVICE_NOT_FOUND.to_string()
    }

    fn resolve_audio_device(&self, identity: &DeviceIdentity) -> String {
        let configured = &self.config.ffm_opts.a_dev;
        let cards = if configured.trim().starts_with(AUTO) {
            audio::read_cards()
        } else {
            Vec::new()
        };
        audio::resolve_audio_device(
            configured,
            &cards,
            &self.config.capture.channel_family,
            &identity.bus_info,
        )
        .unwrap_or_else(|| {
            error!(
                "No audio input found for {}, using {}",
                identity.bus_info, AUDIO_DEVICE_FALLBACK
            );
            AUDIO_DEVICE_FALLBACK.to_string()
        })
    }

    fn start_session(&mut self, snapshot: SignalSnapshot, auto_recovery: bool) -> Result<()> {
        let identity = self.target.clone().unwrap_or_default();
        let started_at = Local::now();
        let out_dir = expand_output_path(&self.settings.output_template, &started_at);
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

        let files = SessionFiles::new(out_dir, started_at, &self.config.ffm_opts.out_fmt);
        let video_device = self.resolve_video_device(&identity);
        let audio_device = self.resolve_audio_device(&identity);
        let frame_rate = snapshot.frame_rate();

        let ffmpeg_cmd = build_ffmpeg_command(
            &self.config.ffm_opts,
            &RecorderInput {
                cx: snapshot.cx,
                cy: snapshot.cy,
                frame_rate,
                video_device: &video_device,
                audio_device: &audio_device,
                instance_tag: &self.settings.instance_tag,
                output: &files.provisional,
            },
        );
        let conduct = &self.config.conduct_opts;
        let command = if conduct.enabled {
            expand_macros(
                &conduct.cmd,
                &[
                    ("duct_bin", conduct.duct_bin.as_str()),
                    ("start_ts", files.start_ts.as_str()),
                    ("prefix", files.duct_prefix.as_str()),
                    ("ffmpeg_cmd", ffmpeg_cmd.as_str()),
                ],
            )
        } else {
            ffmpeg_cmd
        };

        let logger = if self.config.session_logger_enabled {
            SessionLogger::create(
                &files.session_log(),
                self.config.session_logger_level,
                &self.config.session_logger_pattern,
                self.settings.echo_output,
            )?
        } else {
            SessionLogger::disabled(self.settings.echo_output)
        };

        let begin = Record::SessionBegin {
            app_name: self.settings.app_name.clone(),
            serial: identity.serial.clone(),
            v_dev: video_device.clone(),
            a_dev: audio_device.clone(),
            cap_ts_start: files.start_ts.clone(),
            cap_isotime_start: iso_str(&started_at),
            cx: snapshot.cx,
            cy: snapshot.cy,
            frame_rate,
            auto_recovery,
        };
        log_record(&begin, Some(logger.as_ref()));
        self.notifier.push(
            Message::info(format!(
                "{} session {} begin, {}x{} {} fps",
                self.settings.app_name, files.start_ts, snapshot.cx, snapshot.cy, frame_rate
            ))
            .with_payload(json!({
                "serial": identity.serial,
                "vDev": video_device,
                "aDev": audio_device,
                "cx": snapshot.cx,
                "cy": snapshot.cy,
                "frameRate": frame_rate,
                "autoRecovery": auto_recovery,
            })),
        );

        let start_ts = files.start_ts.clone();
        let heartbeat = Arc::new(Heartbeat::new());
        heartbeat.beat();
        let recorder = Arc::new(ProcessSlot::new());
        let finalizer = Arc::new(SessionFinalizer::new(
            &self.settings.app_name,
            files,
            logger.clone(),
            self.notifier.clone(),
        ));

        let body = RecordingBody {
            command,
            launcher: self.launcher.clone(),
            slot: recorder.clone(),
            heartbeat: heartbeat.clone(),
            logger: logger.clone(),
            finalizer: finalizer.clone(),
        };
        self.recordings.schedule(Some(Arc::new(Worker::new(
            format!("recording-{}", start_ts),
            Arc::new(body),
        ))));

        let companion = if self.config.ext_proc_opts.enabled {
            let slot = Arc::new(ProcessSlot::new());
            let body = ExtProcBody {
                opts: self.config.ext_proc_opts.clone(),
                regex: self.status_regex.clone(),
                launcher: self.launcher.clone(),
                slot: slot.clone(),
                logger: logger.clone(),
            };
            self.companions.schedule(Some(Arc::new(Worker::new(
                format!("ext-proc-{}", start_ts),
                Arc::new(body),
            ))));
            Some(slot)
        } else {
            None
        };

        info!("{}:\tStarted recording: {}", start_ts, snapshot);
        self.active = Some(ActiveSession {
            snapshot,
            auto_recovery,
            heartbeat,
            recorder,
            companion,
            logger,
            finalizer,
        });

        if !self.settings.start_settle.is_zero() {
            self.shutdown.sleep(self.settings.start_settle);
        }
        Ok(())
    }

    /// Stop the active session, if any. Safe to call when idle.
    pub fn stop_session(&mut self, reason: &str) {
        let Some(active) = self.active.take() else {
            debug!("Not recording: {}", reason);
            return;
        };

        let stopped_at = Local::now();
        let files = active.files();
        log_record(
            &Record::CaptureStop {
                message: reason.to_string(),
                cap_ts_start: files.start_ts.clone(),
                cap_isotime_start: iso_str(&files.started_at),
                cap_ts_stop: time_str(&stopped_at),
                cap_isotime_stop: iso_str(&stopped_at),
            },
            Some(active.logger.as_ref()),
        );

        active
            .recorder
            .terminate("recorder", &self.settings.recorder_policy);
        if let Some(companion) = &active.companion {
            companion.terminate("external process", &self.settings.companion_policy);
        }
        self.recordings.schedule(None);
        self.companions.schedule(None);

        active.finalizer.finalize(FINALIZE_UNFINISHED);
        info!("{}{}", time_str(&stopped_at), reason);
        self.last_stop_reason = Some(reason.to_string());
    }

    fn config_changed(&self) -> bool {
        let Some(watch) = &self.config_watch else {
            return false;
        };
        match file_hash(&watch.path) {
            Ok(hash) if hash != watch.hash => {
                info!("Config file {} changed", watch.path.display());
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        }
    }
}

impl<D: CaptureDevice> Drop for SessionController<D> {
    fn drop(&mut self) {
        self.stop_session("Controller dropped");
    }
}
