//! FIFO task queue drained by a single background worker

use super::{panic_message, RunBody, Worker, WorkerContext, WorkerError};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, warn};

const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Per-queue task processing.
pub trait TaskHandler<T>: Send + Sync + 'static {
    fn do_task(&self, task: T) -> anyhow::Result<()>;
}

struct Shared<T> {
    tasks: Mutex<VecDeque<T>>,
    wake: Condvar,
}

impl<T> Shared<T> {
    fn push(&self, task: T) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
        self.wake.notify_one();
    }

    fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Cloneable producer handle. Pushing never blocks on the consumer.
pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    pub fn push(&self, task: T) {
        self.shared.push(task);
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len() == 0
    }
}

struct Consumer<T, H> {
    shared: Arc<Shared<T>>,
    handler: H,
    idle_wait: Duration,
}

impl<T, H> RunBody for Consumer<T, H>
where
    T: Send + 'static,
    H: TaskHandler<T>,
{
    fn run(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        loop {
            let task = {
                let mut tasks = self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                if ctx.is_cancelled() {
                    break;
                }
                if tasks.is_empty() {
                    tasks = self
                        .shared
                        .wake
                        .wait_timeout(tasks, self.idle_wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    if ctx.is_cancelled() {
                        break;
                    }
                }
                tasks.pop_front()
            };

            let Some(task) = task else {
                continue;
            };

            match panic::catch_unwind(AssertUnwindSafe(|| self.handler.do_task(task))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Task in '{}' failed: {:#}", ctx.name(), e),
                Err(payload) => error!(
                    "Task in '{}' panicked: {}",
                    ctx.name(),
                    panic_message(payload.as_ref())
                ),
            }
        }

        let dropped = self.shared.len();
        if dropped > 0 {
            warn!("Queue '{}' stopped with {} undelivered task(s)", ctx.name(), dropped);
        }
        Ok(())
    }

    fn cancel(&self) {
        // Notify under the lock so a consumer between its flag check and its wait
        // cannot miss the wakeup.
        let _tasks = self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.wake.notify_all();
    }
}

pub struct TaskQueue<T> {
    shared: Arc<Shared<T>>,
    worker: Worker,
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new<H: TaskHandler<T>>(name: &str, handler: H) -> Self {
        Self::with_idle_wait(name, handler, IDLE_WAIT)
    }

    pub fn with_idle_wait<H: TaskHandler<T>>(name: &str, handler: H, idle_wait: Duration) -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
        });
        let consumer = Consumer {
            shared: shared.clone(),
            handler,
            idle_wait,
        };
        Self {
            shared,
            worker: Worker::new(name, Arc::new(consumer)),
        }
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        self.worker.start()
    }

    pub fn stop(&self) -> Result<(), WorkerError> {
        self.worker.stop()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn push(&self, task: T) {
        self.shared.push(task);
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len() == 0
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn sender(&self) -> QueueSender<T> {
        QueueSender {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::wait_until;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        active: Arc<AtomicUsize>,
        overlapped: Arc<AtomicUsize>,
    }

    impl TaskHandler<u32> for Recorder {
        fn do_task(&self, task: u32) -> anyhow::Result<()> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(5));
            self.seen.lock().unwrap().push(task);
            self.active.fetch_sub(1, Ordering::SeqCst);
            match task {
                13 => anyhow::bail!("unlucky"),
                99 => panic!("task panicked"),
                _ => Ok(()),
            }
        }
    }

    fn recorder() -> (Recorder, Arc<Mutex<Vec<u32>>>, Arc<AtomicUsize>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let handler = Recorder {
            seen: seen.clone(),
            active: Arc::new(AtomicUsize::new(0)),
            overlapped: overlapped.clone(),
        };
        (handler, seen, overlapped)
    }

    #[test]
    fn test_fifo_order() {
        let (handler, seen, overlapped) = recorder();
        let queue = TaskQueue::new("fifo", handler);
        queue.start().unwrap();

        let sender = queue.sender();
        for task in [1, 2, 3] {
            sender.push(task);
        }

        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 3));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
        assert!(queue.is_empty());
        queue.stop().unwrap();
    }

    #[test]
    fn test_failing_tasks_do_not_kill_consumer() {
        let (handler, seen, _) = recorder();
        let queue = TaskQueue::new("failing", handler);
        queue.start().unwrap();

        queue.push(13);
        queue.push(99);
        queue.push(4);

        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 3));
        assert_eq!(*seen.lock().unwrap(), vec![13, 99, 4]);
        assert!(queue.is_running());
        queue.stop().unwrap();
    }

    #[test]
    fn test_stop_does_not_wait_for_idle_tick() {
        let (handler, _, _) = recorder();
        let queue = TaskQueue::with_idle_wait("slow-tick", handler, Duration::from_secs(30));
        queue.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let begin = std::time::Instant::now();
        queue.stop().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert!(!queue.is_running());
    }

    #[test]
    fn test_push_before_start_is_delivered() {
        let (handler, seen, _) = recorder();
        let queue = TaskQueue::new("early", handler);
        queue.push(7);
        assert_eq!(queue.len(), 1);
        queue.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 1));
        queue.stop().unwrap();
    }
}
