//! One recording session: the worker body that runs the recorder and the
//! finalizer that closes the session exactly once.

use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::process::{run_supervised, ProcessLauncher, ProcessSlot, Signal};
use super::{final_video_file, rename_duct_files, rename_video_file};
use crate::notifications::{Message, Notifier};
use crate::session::metadata::{log_record, Record};
use crate::session::{iso_str, time_str, SessionLogger};
use crate::worker::{RunBody, WorkerContext};

/// Last time the recorder showed signs of life.
pub struct Heartbeat {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn beat(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::SeqCst);
    }

    pub fn age(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::SeqCst));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a session writes and how it is named.
#[derive(Debug, Clone)]
pub struct SessionFiles {
    pub out_dir: PathBuf,
    pub start_ts: String,
    pub started_at: DateTime<Local>,
    pub ext: String,
    pub provisional: PathBuf,
    pub duct_prefix: String,
}

impl SessionFiles {
    pub fn new(out_dir: PathBuf, started_at: DateTime<Local>, ext: &str) -> Self {
        let start_ts = time_str(&started_at);
        let provisional = super::provisional_video_file(&out_dir, &start_ts, ext);
        let duct_prefix = format!("{}.duct_", provisional.display());
        Self {
            out_dir,
            start_ts,
            started_at,
            ext: ext.to_string(),
            provisional,
            duct_prefix,
        }
    }

    pub fn session_log(&self) -> PathBuf {
        PathBuf::from(format!("{}.log", self.provisional.display()))
    }
}

/// Renames the output, writes the end record, closes the session log and
/// announces the end. Only the first call does anything.
pub struct SessionFinalizer {
    app_name: String,
    files: SessionFiles,
    logger: Arc<SessionLogger>,
    notifier: Notifier,
    done: AtomicBool,
    final_path: Mutex<Option<PathBuf>>,
}

impl SessionFinalizer {
    pub fn new(
        app_name: &str,
        files: SessionFiles,
        logger: Arc<SessionLogger>,
        notifier: Notifier,
    ) -> Self {
        Self {
            app_name: app_name.to_string(),
            files,
            logger,
            notifier,
            done: AtomicBool::new(false),
            final_path: Mutex::new(None),
        }
    }

    pub fn files(&self) -> &SessionFiles {
        &self.files
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn final_path(&self) -> Option<PathBuf> {
        self.final_path
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn finalize(&self, message: &str) -> Option<PathBuf> {
        if self.done.swap(true, Ordering::SeqCst) {
            return None;
        }

        let files = &self.files;
        let stop_ts = time_str(&Local::now());
        let final_path = final_video_file(&files.out_dir, &files.start_ts, &stop_ts, &files.ext);
        if let Err(e) = rename_video_file(&files.provisional, &final_path, message) {
            error!(
                "Failed to rename {} to {}: {}",
                files.provisional.display(),
                final_path.display(),
                e
            );
        }

        log_record(
            &Record::SessionEnd {
                message: message.to_string(),
                cap_ts_start: files.start_ts.clone(),
                cap_isotime_start: iso_str(&files.started_at),
            },
            Some(self.logger.as_ref()),
        );
        let log_target = PathBuf::from(format!("{}.log", final_path.display()));
        if let Err(e) = self.logger.close_and_rename(&log_target) {
            warn!("{:#}", e);
        }

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.notifier.push(Message::info(format!(
            "{} session {} end, saved to {}",
            self.app_name, files.start_ts, file_name
        )));

        rename_duct_files(&files.duct_prefix, &format!("{}.duct_", final_path.display()));

        *self.final_path.lock().unwrap_or_else(PoisonError::into_inner) = Some(final_path.clone());
        Some(final_path)
    }
}

/// Worker body running the recorder until it exits or is killed.
pub struct RecordingBody {
    pub command: String,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub slot: Arc<ProcessSlot>,
    pub heartbeat: Arc<Heartbeat>,
    pub logger: Arc<SessionLogger>,
    pub finalizer: Arc<SessionFinalizer>,
}

impl RunBody for RecordingBody {
    fn run(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        self.heartbeat.beat();
        info!("{}: <SYSTEMCALL> {}", self.finalizer.files().start_ts, self.command);

        let result = run_supervised(
            self.launcher.as_ref(),
            &self.command,
            &self.slot,
            || self.heartbeat.beat(),
            |line| self.logger.output(line),
        );
        match result {
            Ok(Some(status)) => info!("Recorder in '{}' exited: {}", ctx.name(), status),
            Ok(None) => info!("Recorder in '{}' exited", ctx.name()),
            Err(e) => error!("Failed to run recorder in '{}': {}", ctx.name(), e),
        }

        self.heartbeat.beat();
        self.finalizer.finalize(":\tRecorder process terminated.");
        Ok(())
    }

    fn cancel(&self) {
        self.slot.signal(Signal::Kill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::tests::MemorySink;
    use crate::notifications::notification_queue;
    use crate::recorder::process::ShellLauncher;
    use crate::session::LogLevel;
    use crate::worker::tests::wait_until;
    use crate::worker::Worker;

    fn files_in(dir: &std::path::Path) -> SessionFiles {
        SessionFiles::new(dir.to_path_buf(), Local::now(), "mkv")
    }

    #[test]
    fn test_heartbeat_age() {
        let heartbeat = Heartbeat::new();
        heartbeat.beat();
        assert!(heartbeat.age() < Duration::from_millis(500));
        std::thread::sleep(Duration::from_millis(60));
        assert!(heartbeat.age() >= Duration::from_millis(50));
        heartbeat.beat();
        assert!(heartbeat.age() < Duration::from_millis(50));
    }

    #[test]
    fn test_finalize_renames_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let files = files_in(dir.path());
        std::fs::write(&files.provisional, b"video").unwrap();
        let logger =
            SessionLogger::create(&files.session_log(), LogLevel::Info, "%H:%M:%S", false).unwrap();

        let sink = MemorySink::default();
        let queue = notification_queue(Box::new(sink.clone()), 0);
        queue.start().unwrap();

        let finalizer = SessionFinalizer::new("vidcap-agent", files.clone(), logger, queue.sender());
        let final_path = finalizer.finalize("done").unwrap();
        assert!(finalizer.finalize("again").is_none());

        assert!(!files.provisional.exists());
        assert!(final_path.exists());
        let name = final_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("{}--", files.start_ts)));
        assert!(name.ends_with(".mkv"));
        assert!(PathBuf::from(format!("{}.log", final_path.display())).exists());
        assert!(!files.session_log().exists());

        assert!(wait_until(Duration::from_secs(2), || sink.descriptions().len() == 1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.descriptions().len(), 1);
        assert!(sink.descriptions()[0].ends_with(&name));
        queue.stop().unwrap();
    }

    #[test]
    fn test_recording_body_finalizes_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let files = files_in(dir.path());
        let provisional = files.provisional.clone();
        let logger =
            SessionLogger::create(&files.session_log(), LogLevel::Info, "%H:%M:%S", false).unwrap();
        let queue = notification_queue(Box::new(MemorySink::default()), 0);
        let finalizer = Arc::new(SessionFinalizer::new(
            "vidcap-agent",
            files,
            logger.clone(),
            queue.sender(),
        ));

        let command = format!("echo recording > '{}'; echo frame=1", provisional.display());
        let body = RecordingBody {
            command,
            launcher: Arc::new(ShellLauncher),
            slot: Arc::new(ProcessSlot::new()),
            heartbeat: Arc::new(Heartbeat::new()),
            logger,
            finalizer: finalizer.clone(),
        };
        let worker = Worker::new("recording", Arc::new(body));
        worker.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || finalizer.final_path().is_some()));
        assert!(finalizer.is_done());
        let final_path = finalizer.final_path().unwrap();
        assert!(final_path.exists());
        let log = std::fs::read_to_string(format!("{}.log", final_path.display())).unwrap();
        assert!(log.contains("frame=1"));
        assert!(log.contains("session_end"));
        worker.stop().unwrap();
    }
}
