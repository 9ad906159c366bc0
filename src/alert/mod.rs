//! Alerting: threshold state machine, notification fan-out and incident sync.

mod engine;
mod incident;
mod notify;

pub use engine::*;
pub use incident::*;
pub use notify::*;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A notification destination attached to an alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// Generic JSON webhook.
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Slack {
        url: String,
    },
    Discord {
        url: String,
    },
    /// Write the notification to the service log.
    Log,
}

impl ChannelConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelConfig::Webhook { .. } => "webhook",
            ChannelConfig::Slack { .. } => "slack",
            ChannelConfig::Discord { .. } => "discord",
            ChannelConfig::Log => "log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_json() {
        let channels: Vec<ChannelConfig> = serde_json::from_str(
            r#"[
                {"kind": "slack", "url": "https://hooks.slack.com/x"},
                {"kind": "webhook", "url": "https://example.com/hook", "headers": {"X-Token": "t"}},
                {"kind": "log"}
            ]"#,
        )
        .unwrap();
        assert_eq!(channels[0].name(), "slack");
        assert!(matches!(&channels[1], ChannelConfig::Webhook { headers, .. } if headers["X-Token"] == "t"));
        assert_eq!(channels[2], ChannelConfig::Log);
    }
}
