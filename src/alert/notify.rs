//! Notification rendering and delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinSet;

use super::ChannelConfig;
use crate::db::AlertClass;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel rejected notification with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEvent {
    Triggered,
    Resolved,
}

/// Everything a channel needs to describe an alert transition.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub event: AlertEvent,
    pub monitor_tag: String,
    pub monitor_name: String,
    pub status_class: AlertClass,
    pub description: Option<String>,
    pub health_checks: u32,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub incident_ref: Option<String>,
}

impl AlertMessage {
    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        let mut line = match self.event {
            AlertEvent::Triggered => format!(
                "[{}] {} is {} ({} consecutive checks)",
                self.status_class.as_str(),
                self.monitor_name,
                self.status_class.as_str(),
                self.health_checks
            ),
            AlertEvent::Resolved => format!(
                "[RESOLVED] {} recovered from {}",
                self.monitor_name,
                self.status_class.as_str()
            ),
        };
        if let Some(desc) = &self.description {
            line.push_str(": ");
            line.push_str(desc);
        }
        line
    }
}

/// Build the payload sent to one channel.
pub fn render_payload(channel: &ChannelConfig, msg: &AlertMessage) -> Value {
    match channel {
        ChannelConfig::Webhook { .. } => json!({
            "event": msg.event,
            "monitor": {"tag": msg.monitor_tag, "name": msg.monitor_name},
            "status_class": msg.status_class,
            "description": msg.description,
            "health_checks": msg.health_checks,
            "triggered_at": msg.triggered_at,
            "resolved_at": msg.resolved_at,
            "incident": msg.incident_ref,
            "summary": msg.summary(),
        }),
        ChannelConfig::Slack { .. } => json!({ "text": msg.summary() }),
        ChannelConfig::Discord { .. } => json!({ "content": msg.summary() }),
        ChannelConfig::Log => json!({ "message": msg.summary() }),
    }
}

/// Delivers a rendered payload to a channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn deliver(&self, channel: &ChannelConfig, payload: &Value) -> Result<(), NotifyError>;
}

/// Production sender: HTTP POST for hook channels, tracing for the log channel.
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for HttpSender {
    async fn deliver(&self, channel: &ChannelConfig, payload: &Value) -> Result<(), NotifyError> {
        let request = match channel {
            ChannelConfig::Log => {
                tracing::info!(target: "uptrail::alert", %payload, "alert notification");
                return Ok(());
            }
            ChannelConfig::Webhook { url, headers } => {
                let mut request = self.client.post(url);
                for (key, value) in headers {
                    request = request.header(key, value);
                }
                request
            }
            ChannelConfig::Slack { url } | ChannelConfig::Discord { url } => self.client.post(url),
        };

        let response = request.json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

/// Default bound on a single channel delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fans a message out to every channel of a rule. A failing or hung channel
/// never affects the others.
pub struct Dispatcher {
    sender: Arc<dyn ChannelSender>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(sender: Arc<dyn ChannelSender>) -> Self {
        Self {
            sender,
            timeout: DELIVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deliver to all channels concurrently, each under the delivery timeout.
    /// Returns how many deliveries succeeded.
    pub async fn dispatch(&self, channels: &[ChannelConfig], msg: &AlertMessage) -> usize {
        let mut deliveries = JoinSet::new();
        for channel in channels {
            let payload = render_payload(channel, msg);
            let sender = self.sender.clone();
            let channel = channel.clone();
            let timeout = self.timeout;
            deliveries.spawn(async move {
                let result = tokio::time::timeout(timeout, sender.deliver(&channel, &payload)).await;
                (channel.name(), result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => delivered += 1,
                Ok((channel, Ok(Err(e)))) => {
                    tracing::warn!(monitor = %msg.monitor_tag, channel, "notification failed: {}", e)
                }
                Ok((channel, Err(_))) => tracing::warn!(
                    monitor = %msg.monitor_tag,
                    channel,
                    "notification timed out after {:?}",
                    self.timeout
                ),
                Err(e) => tracing::error!(monitor = %msg.monitor_tag, "notification task failed: {}", e),
            }
        }
        delivered
    }

    /// Dispatch on a separate task.
    pub fn spawn(self: &Arc<Self>, channels: Vec<ChannelConfig>, msg: AlertMessage) -> tokio::task::JoinHandle<usize> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch(&channels, &msg).await })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records deliveries; fails for channels listed in `failing` and never
    /// answers for those in `hanging`.
    #[derive(Default)]
    pub struct RecordingSender {
        pub delivered: Mutex<Vec<(String, Value)>>,
        pub failing: Vec<&'static str>,
        pub hanging: Vec<&'static str>,
    }

    impl RecordingSender {
        pub fn count(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        async fn deliver(&self, channel: &ChannelConfig, payload: &Value) -> Result<(), NotifyError> {
            if self.hanging.contains(&channel.name()) {
                std::future::pending::<()>().await;
            }
            if self.failing.contains(&channel.name()) {
                return Err(NotifyError::Rejected { status: 500, body: "down".into() });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((channel.name().to_string(), payload.clone()));
            Ok(())
        }
    }

    fn message(event: AlertEvent) -> AlertMessage {
        AlertMessage {
            event,
            monitor_tag: "api".into(),
            monitor_name: "Public API".into(),
            status_class: AlertClass::Down,
            description: Some("checkout is failing".into()),
            health_checks: 3,
            triggered_at: Utc::now(),
            resolved_at: None,
            incident_ref: None,
        }
    }

    #[test]
    fn test_render_payloads() {
        let msg = message(AlertEvent::Triggered);
        let slack = render_payload(&ChannelConfig::Slack { url: "u".into() }, &msg);
        assert_eq!(slack["text"], "[DOWN] Public API is DOWN (3 consecutive checks): checkout is failing");

        let discord = render_payload(&ChannelConfig::Discord { url: "u".into() }, &msg);
        assert!(discord["content"].as_str().unwrap().starts_with("[DOWN]"));

        let hook = render_payload(
            &ChannelConfig::Webhook { url: "u".into(), headers: Default::default() },
            &msg,
        );
        assert_eq!(hook["event"], "triggered");
        assert_eq!(hook["monitor"]["tag"], "api");
        assert_eq!(hook["status_class"], "DOWN");
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let sender = Arc::new(RecordingSender {
            failing: vec!["slack"],
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(sender.clone());
        let channels = vec![
            ChannelConfig::Slack { url: "u".into() },
            ChannelConfig::Discord { url: "u".into() },
            ChannelConfig::Log,
        ];

        let delivered = dispatcher.dispatch(&channels, &message(AlertEvent::Resolved)).await;
        assert_eq!(delivered, 2);
        assert_eq!(sender.count(), 2);
    }

    #[tokio::test]
    async fn test_hung_channel_does_not_block_others() {
        let sender = Arc::new(RecordingSender {
            hanging: vec!["slack"],
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(sender.clone()).with_timeout(Duration::from_millis(100));
        let channels = vec![
            ChannelConfig::Slack { url: "u".into() },
            ChannelConfig::Discord { url: "u".into() },
            ChannelConfig::Log,
        ];

        let delivered = tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.dispatch(&channels, &message(AlertEvent::Triggered)),
        )
        .await
        .unwrap();
        assert_eq!(delivered, 2);

        let mut names: Vec<String> = sender.delivered.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["discord", "log"]);
    }
}
