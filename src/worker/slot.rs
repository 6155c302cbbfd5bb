//! Single-slot scheduler: at most one active worker at a time

use super::Worker;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Slots {
    active: Option<Arc<Worker>>,
    previous: Option<Arc<Worker>>,
}

/// Holds one active worker. Scheduling a replacement stops the current one
/// first; a worker that refuses to stop is kept for one more attempt on the
/// next call and then leaked.
pub struct SingleSlotScheduler {
    name: String,
    slots: Mutex<Slots>,
}

impl SingleSlotScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Replace the active worker with `next`, or clear the slot with `None`.
    pub fn schedule(&self, next: Option<Arc<Worker>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(stuck) = slots.previous.take() {
            if let Err(e) = stuck.stop() {
                error!(
                    "[{}] Worker '{}' still refuses to stop, leaking it: {}",
                    self.name,
                    stuck.name(),
                    e
                );
            } else {
                debug!("[{}] Disposed retired worker '{}'", self.name, stuck.name());
            }
        }

        if let (Some(current), Some(worker)) = (&slots.active, &next) {
            if Arc::ptr_eq(current, worker) {
                debug!("[{}] Worker '{}' is already active", self.name, worker.name());
                return;
            }
        }

        if let Some(current) = slots.active.take() {
            debug!("[{}] Retiring worker '{}'", self.name, current.name());
            match current.stop() {
                Ok(()) => debug!("[{}] Worker '{}' stopped", self.name, current.name()),
                Err(e) => {
                    warn!("[{}] {}; will retry on next schedule", self.name, e);
                    slots.previous = Some(current);
                }
            }
        }

        if let Some(worker) = &next {
            if !worker.is_running() {
                info!("[{}] Starting worker '{}'", self.name, worker.name());
                if let Err(e) = worker.start() {
                    error!("[{}] {}", self.name, e);
                }
            }
        }
        slots.active = next;
    }

    pub fn shutdown(&self) {
        self.schedule(None);
        self.schedule(None);
    }

    pub fn current(&self) -> Option<Arc<Worker>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    /// True while a retired worker is still waiting to be disposed.
    pub fn has_retired(&self) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .previous
            .is_some()
    }
}

impl Drop for SingleSlotScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::spinning;
    use crate::worker::{RunBody, WorkerContext};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_schedule_replaces_active() {
        let scheduler = SingleSlotScheduler::new("test");
        let a = spinning("a");
        let b = spinning("b");

        scheduler.schedule(Some(a.clone()));
        assert!(a.is_running());
        assert!(!a.is_terminated());

        scheduler.schedule(Some(b.clone()));
        assert!(!a.is_running());
        assert!(a.is_terminated());
        assert!(b.is_running());
        assert!(Arc::ptr_eq(&scheduler.current().unwrap(), &b));

        scheduler.shutdown();
        assert!(!b.is_running());
        assert!(scheduler.current().is_none());
    }

    #[test]
    fn test_double_clear_leaves_nothing_running() {
        let scheduler = SingleSlotScheduler::new("test");
        let a = spinning("a");
        scheduler.schedule(Some(a.clone()));
        scheduler.schedule(None);
        scheduler.schedule(None);
        assert!(!a.is_running());
        assert!(scheduler.current().is_none());
        assert!(!scheduler.has_retired());
    }

    #[test]
    fn test_slow_worker_is_retried_next_call() {
        struct Slow {
            stop_requested: AtomicBool,
        }
        impl RunBody for Slow {
            fn run(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            }
            fn cancel(&self) {
                self.stop_requested.store(true, Ordering::SeqCst);
            }
        }

        let slow = Arc::new(
            Worker::new(
                "slow",
                Arc::new(Slow {
                    stop_requested: AtomicBool::new(false),
                }),
            )
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(50)),
        );

        let scheduler = SingleSlotScheduler::new("test");
        scheduler.schedule(Some(slow.clone()));
        scheduler.schedule(None);
        assert!(scheduler.has_retired());
        assert!(slow.is_terminated());

        std::thread::sleep(Duration::from_millis(400));
        scheduler.schedule(None);
        assert!(!scheduler.has_retired());
        assert!(!slow.is_running());
    }

    #[test]
    fn test_rescheduling_active_worker_keeps_it_running() {
        let scheduler = SingleSlotScheduler::new("test");
        let a = spinning("a");
        scheduler.schedule(Some(a.clone()));
        scheduler.schedule(Some(a.clone()));
        assert!(a.is_running());
        assert!(!a.is_terminated());
        assert!(Arc::ptr_eq(&scheduler.current().unwrap(), &a));
        scheduler.shutdown();
        assert!(!a.is_running());
    }

    #[test]
    fn test_already_running_worker_is_not_restarted() {
        let scheduler = SingleSlotScheduler::new("test");
        let a = spinning("a");
        a.start().unwrap();
        scheduler.schedule(Some(a.clone()));
        assert!(a.is_running());
        scheduler.shutdown();
    }
}
