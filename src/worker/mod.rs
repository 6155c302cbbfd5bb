//! Background workers
//!
//! A [`Worker`] runs one [`RunBody`] on a dedicated OS thread. Start and exit
//! are confirmed through one-shot channels; cancellation is cooperative via a
//! flag the body polls through its [`WorkerContext`], plus an optional
//! `cancel` hook for bodies blocked on something the flag cannot reach (a
//! child process, a condition variable).

pub mod queue;
pub mod slot;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

pub use queue::{QueueSender, TaskHandler, TaskQueue};
pub use slot::SingleSlotScheduler;

/// Default bound for start confirmation
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound for exit confirmation after a stop request
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

const SLEEP_SLICE: Duration = Duration::from_millis(20);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker '{0}' was already started")]
    AlreadyStarted(String),

    #[error("failed to spawn thread for worker '{name}': {reason}")]
    Spawn { name: String, reason: String },

    #[error("worker '{name}' did not confirm start within {timeout:?}")]
    StartTimeout { name: String, timeout: Duration },

    #[error("worker '{name}' did not exit within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },
}

/// Externally visible lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    StopRequested,
    Terminated,
}

/// Handed to a running body so it can observe cancellation.
#[derive(Clone)]
pub struct WorkerContext {
    name: Arc<str>,
    terminated: Arc<AtomicBool>,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices. Returns `false` if the worker
    /// was cancelled before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// The work a [`Worker`] performs on its thread.
pub trait RunBody: Send + Sync + 'static {
    fn run(&self, ctx: &WorkerContext) -> anyhow::Result<()>;

    /// Called from the stopping thread after the cancellation flag is set.
    fn cancel(&self) {}
}

struct Flags {
    started: AtomicBool,
    running: AtomicBool,
    terminated: Arc<AtomicBool>,
}

pub struct Worker {
    name: Arc<str>,
    body: Arc<dyn RunBody>,
    flags: Arc<Flags>,
    start_timeout: Duration,
    stop_timeout: Duration,
    exited_rx: Mutex<Option<Receiver<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: impl Into<String>, body: Arc<dyn RunBody>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            body,
            flags: Arc::new(Flags {
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                terminated: Arc::new(AtomicBool::new(false)),
            }),
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            exited_rx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn with_timeouts(mut self, start_timeout: Duration, stop_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    /// True once a stop has been requested.
    pub fn is_terminated(&self) -> bool {
        self.flags.terminated.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WorkerState {
        let running = self.is_running();
        let terminated = self.is_terminated();
        match (self.flags.started.load(Ordering::SeqCst), running, terminated) {
            (false, _, _) => WorkerState::Idle,
            (true, true, false) => WorkerState::Running,
            (true, true, true) => WorkerState::StopRequested,
            (true, false, _) => WorkerState::Terminated,
        }
    }

    /// Spawn the body and wait until it confirms it has begun.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut handle_slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.flags.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyStarted(self.name.to_string()));
        }

        let (started_tx, started_rx) = mpsc::sync_channel::<()>(1);
        let (exited_tx, exited_rx) = mpsc::sync_channel::<()>(1);

        let body = self.body.clone();
        let flags = self.flags.clone();
        let ctx = WorkerContext {
            name: self.name.clone(),
            terminated: self.flags.terminated.clone(),
        };

        let spawned = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || {
                flags.running.store(true, Ordering::SeqCst);
                let _ = started_tx.send(());
                debug!("Worker '{}' started", ctx.name());

                match panic::catch_unwind(AssertUnwindSafe(|| body.run(&ctx))) {
                    Ok(Ok(())) => debug!("Worker '{}' finished", ctx.name()),
                    Ok(Err(e)) => error!("Worker '{}' failed: {:#}", ctx.name(), e),
                    Err(payload) => error!(
                        "Worker '{}' panicked: {}",
                        ctx.name(),
                        panic_message(payload.as_ref())
                    ),
                }

                flags.running.store(false, Ordering::SeqCst);
                let _ = exited_tx.send(());
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return Err(WorkerError::Spawn {
                    name: self.name.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        *handle_slot = Some(handle);
        *self.exited_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(exited_rx);

        match started_rx.recv_timeout(self.start_timeout) {
            Ok(()) => Ok(()),
            // The body already ran to completion and dropped its sender.
            Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(WorkerError::StartTimeout {
                name: self.name.to_string(),
                timeout: self.start_timeout,
            }),
        }
    }

    /// Request cancellation and wait (bounded) for the body to exit.
    pub fn stop(&self) -> Result<(), WorkerError> {
        self.stop_within(self.stop_timeout)
    }

    pub fn stop_within(&self, timeout: Duration) -> Result<(), WorkerError> {
        self.flags.terminated.store(true, Ordering::SeqCst);
        self.body.cancel();

        let mut exited_rx = self.exited_rx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rx) = exited_rx.as_ref() else {
            // Never started, nothing to wait for.
            return Ok(());
        };

        match rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                *exited_rx = None;
                drop(exited_rx);
                self.join();
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(WorkerError::StopTimeout {
                name: self.name.to_string(),
                timeout,
            }),
        }
    }

    fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Panics are caught inside the thread, join only reaps it.
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.is_running() {
            self.join();
            return;
        }
        if let Err(e) = self.stop() {
            // Detach: the thread keeps its own Arcs and ends whenever the body returns.
            warn!("Leaking worker thread: {}", e);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
