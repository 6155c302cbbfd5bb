//! Outbound status notifications
//!
//! Producers push [`Message`]s through a [`Notifier`]; one background queue
//! hands them to a [`NotificationSink`]. Delivery is best effort: a failing
//! sink is logged and never reaches the producer.

pub mod rest;

use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info};

use crate::session::iso_str;
use crate::worker::{QueueSender, TaskHandler, TaskQueue};

pub use rest::RestSink;

pub type NotificationQueue = TaskQueue<Message>;

/// Producer handle, cheap to clone into workers and callbacks.
pub type Notifier = QueueSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum MessageLevel {
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
}

impl MessageLevel {
    pub fn id(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub level: MessageLevel,
    pub description: String,
    pub payload: Option<serde_json::Value>,
    pub event_on: String,
    pub registered_on: String,
}

impl Message {
    pub fn new(level: MessageLevel, description: impl Into<String>) -> Self {
        let now = iso_str(&Local::now());
        Self {
            level,
            description: description.into(),
            payload: None,
            event_on: now.clone(),
            registered_on: now,
        }
    }

    pub fn info(description: impl Into<String>) -> Self {
        Self::new(MessageLevel::Info, description)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(&self, message: &Message) -> Result<()>;
}

/// Used when no remote endpoint is configured.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, message: &Message) -> Result<()> {
        info!("Notification [{:?}]: {}", message.level, message.description);
        Ok(())
    }
}

struct Dispatcher {
    sink: Box<dyn NotificationSink>,
    min_level: i64,
}

impl TaskHandler<Message> for Dispatcher {
    fn do_task(&self, message: Message) -> Result<()> {
        if message.level.id() < self.min_level {
            debug!("Skipping notification below level {}: {}", self.min_level, message.description);
            return Ok(());
        }
        self.sink.deliver(&message)
    }
}

pub fn notification_queue(sink: Box<dyn NotificationSink>, min_level: i64) -> NotificationQueue {
    TaskQueue::new("notifications", Dispatcher { sink, min_level })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::worker::tests::wait_until;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Collects delivered messages.
    #[derive(Clone, Default)]
    pub(crate) struct MemorySink {
        pub(crate) messages: Arc<Mutex<Vec<Message>>>,
    }

    impl MemorySink {
        pub(crate) fn descriptions(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.description.clone())
                .collect()
        }
    }

    impl NotificationSink for MemorySink {
        fn deliver(&self, message: &Message) -> Result<()> {
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Unreachable;

    impl NotificationSink for Unreachable {
        fn deliver(&self, _message: &Message) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[test]
    fn test_level_filter() {
        let sink = MemorySink::default();
        let queue = notification_queue(Box::new(sink.clone()), MessageLevel::Info.id());
        queue.start().unwrap();

        let notifier = queue.sender();
        notifier.push(Message::new(MessageLevel::Debug, "noise"));
        notifier.push(Message::info("session begin"));
        notifier.push(Message::new(MessageLevel::Error, "disk full"));

        assert!(wait_until(Duration::from_secs(2), || sink.descriptions().len() == 2));
        assert_eq!(sink.descriptions(), vec!["session begin", "disk full"]);
        queue.stop().unwrap();
    }

    #[test]
    fn test_failing_sink_keeps_queue_alive() {
        let queue = notification_queue(Box::new(Unreachable), 0);
        queue.start().unwrap();
        queue.push(Message::info("one"));
        queue.push(Message::info("two"));
        assert!(wait_until(Duration::from_secs(2), || queue.is_empty()));
        assert!(queue.is_running());
        queue.stop().unwrap();
    }

    #[test]
    fn test_message_timestamps() {
        let message = Message::info("x").with_payload(serde_json::json!({"cx": 1920}));
        assert_eq!(message.event_on, message.registered_on);
        assert_eq!(message.payload.unwrap()["cx"], 1920);
    }
}
