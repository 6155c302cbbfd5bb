//! Panic reports
//!
//! Panics are appended to `crash.log` under the agent home directory before
//! the default hook runs, so a crash that happens while nobody watches the
//! console still leaves a backtrace behind.

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::error;

static CRASH_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

const CRASH_LOG_FILENAME: &str = "crash.log";

/// Install the panic hook. Returns the crash log path.
pub fn init_crash_handler(home: &Path) -> PathBuf {
    let crash_log_path = home.join(CRASH_LOG_FILENAME);
    let _ = CRASH_LOG_PATH.set(crash_log_path.clone());

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        handle_panic(panic_info);
        default_hook(panic_info);
    }));

    crash_log_path
}

fn handle_panic(panic_info: &PanicHookInfo) {
    let message = crate::worker::panic_message(panic_info.payload());
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "unknown location".to_string());
    let thread = std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string();

    let report = format_report(
        &chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        &thread,
        &location,
        &message,
        &std::backtrace::Backtrace::force_capture().to_string(),
    );

    if let Some(path) = CRASH_LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(report.as_bytes());
            let _ = file.sync_all();
        }
    }

    error!(
        "PANIC in thread '{}' at {}: {} (see crash.log for the backtrace)",
        thread, location, message
    );
}

fn format_report(ts: &str, thread: &str, location: &str, message: &str, backtrace: &str) -> String {
    let separator = "=".repeat(80);
    format!(
        "\n{sep}\nPANIC at {ts}\n{sep}\nThread: {thread}\nLocation: {location}\nMessage: {message}\n\nBacktrace:\n{backtrace}\n{sep}\n",
        sep = separator,
    )
}
