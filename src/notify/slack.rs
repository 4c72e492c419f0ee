use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

use crate::alerts::{AlertSink, MonitorAlert};

pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
    timeout: Duration,
}

impl SlackNotifier {
    /// `None` when SLACK_WEBHOOK_URL is unset.
    pub fn from_env() -> Option<Self> {
        std::env::var("SLACK_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .map(Self::new)
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

#[async_trait::async_trait]
impl AlertSink for SlackNotifier {
    async fn emit(&self, alert: &MonitorAlert) -> Result<()> {
        let text = format!(
            "*[{}]* {}\nSource: {}\n@ {}",
            alert.severity.as_str().to_ascii_uppercase(),
            alert.message,
            alert.source_id.as_deref().unwrap_or("-"),
            alert.timestamp.to_rfc3339()
        );
        let body = serde_json::json!({ "text": text });

        self.client
            .post(&self.webhook_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}
