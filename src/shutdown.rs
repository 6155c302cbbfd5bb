//! Operator interrupt handling

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::app::EXIT_SYS_BREAK;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Set once when the operator asks the agent to stop. Cloned into every
/// component that has to notice.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`. Returns false if shutdown was requested meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// First Ctrl+C (or SIGTERM) requests a clean stop, the second one exits at once.
pub fn install_ctrlc(signal: ShutdownSignal) -> Result<()> {
    ctrlc::set_handler(move || {
        if signal.is_requested() {
            warn!("Second interrupt received, exiting immediately");
            std::process::exit(EXIT_SYS_BREAK);
        }
        info!("Interrupt received, stopping current session...");
        signal.request();
    })
    .context("Failed to install Ctrl+C handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_is_cut_short() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_millis(10)));

        let remote = signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.request();
        });
        let begin = Instant::now();
        assert!(!signal.sleep(Duration::from_secs(10)));
        assert!(begin.elapsed() < Duration::from_secs(2));
        assert!(signal.is_requested());
    }
}
