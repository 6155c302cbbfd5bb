//! REST notification sink
//!
//! Messages are posted to `{api_base_url}/message/send_message` with every
//! field in the query string, authenticated with an `X-Api-Key` header.

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

use super::{Message, NotificationSink};
use crate::config::NotifyOpts;

const SEND_MESSAGE_PATH: &str = "/message/send_message";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct RestSink {
    client: Client,
    runtime: Runtime,
    url: String,
    opts: NotifyOpts,
}

impl RestSink {
    pub fn new(opts: &NotifyOpts) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_millis(opts.timeout_ms.max(1)))
            .danger_accept_invalid_certs(!opts.verify_ssl_cert)
            .build()
            .context("Failed to build HTTP client")?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create runtime for notifications")?;

        Ok(Self {
            client,
            runtime,
            url: format!("{}{}", opts.api_base_url.trim_end_matches('/'), SEND_MESSAGE_PATH),
            opts: opts.clone(),
        })
    }

    fn query(&self, message: &Message) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("category", self.opts.message_category_id.to_string()),
            ("level", message.level.id().to_string()),
            ("device", self.opts.device_id.to_string()),
            ("provider", self.opts.data_provider_id.to_string()),
            ("description", message.description.clone()),
        ];
        if !self.opts.study.is_empty() {
            params.push(("study", self.opts.study.clone()));
        }
        if let Some(payload) = &message.payload {
            params.push(("payload", payload.to_string()));
        }
        if !message.event_on.is_empty() {
            params.push(("event_on", message.event_on.clone()));
        }
        if !message.registered_on.is_empty() {
            params.push(("registered_on", message.registered_on.clone()));
        }
        params
    }
}

impl NotificationSink for RestSink {
    fn deliver(&self, message: &Message) -> Result<()> {
        let query = self.query(message);
        self.runtime.block_on(async {
            self.client
                .post(&self.url)
                .query(&query)
                .header("X-Api-Key", &self.opts.api_key)
                .header("Accept", "application/json")
                .send()
                .await
                .context("Failed to send notification")?
                .error_for_status()
                .context("Notification endpoint returned error status")?;
            Ok::<(), anyhow::Error>(())
        })?;
        debug!("Notification sent: {}", message.description);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::MessageLevel;

    fn opts() -> NotifyOpts {
        NotifyOpts {
            enabled: true,
            api_base_url: "http://127.0.0.1:9/api/1/".to_string(),
            api_key: "key".to_string(),
            device_id: 3,
            data_provider_id: 4,
            message_category_id: 1,
            timeout_ms: 200,
            ..NotifyOpts::default()
        }
    }

    #[test]
    fn test_url_and_query() {
        let sink = RestSink::new(&opts()).unwrap();
        assert_eq!(sink.url, "http://127.0.0.1:9/api/1/message/send_message");

        let message = Message::new(MessageLevel::Warning, "session end")
            .with_payload(serde_json::json!({"start_ts": "x"}));
        let query = sink.query(&message);
        assert!(query.contains(&("level", "3".to_string())));
        assert!(query.contains(&("device", "3".to_string())));
        assert!(query.contains(&("provider", "4".to_string())));
        assert!(query.contains(&("payload", "{\"start_ts\":\"x\"}".to_string())));
        assert!(!query.iter().any(|(k, _)| *k == "study"));
    }

    #[test]
    fn test_unreachable_endpoint_is_an_error() {
        let sink = RestSink::new(&opts()).unwrap();
        assert!(sink.deliver(&Message::info("hello")).is_err());
    }
}
