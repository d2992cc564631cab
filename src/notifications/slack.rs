//! Slack webhook notifications

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{NotificationSummary, Notifier};
use crate::config::SlackConfig;

#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    channel: Option<String>,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig) -> Result<Self> {
        Self::with_timeout(config, config.timeout())
    }

    pub fn with_timeout(config: &SlackConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            webhook_url: config.webhook_url.clone(),
            channel: config.channel.clone(),
        })
    }

    async fn post(&self, payload: Value) -> Result<()> {
        // Add channel if specified
        let payload = match &self.channel {
            Some(channel) => {
                let mut p = payload;
                p["channel"] = json!(channel);
                p
            }
            None => payload,
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Slack webhook request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Slack webhook failed: {} - {}", status, text);
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        self.post(json!({ "text": message })).await
    }

    async fn notify_run(&self, summary: &NotificationSummary) -> Result<()> {
        self.post(build_run_message(summary)).await
    }
}

/// Block Kit message for a finished run
pub fn build_run_message(summary: &NotificationSummary) -> Value {
    let failed_list = summary
        .failed_steps
        .iter()
        .take(10)
        .map(|s| format!("• {}", s))
        .collect::<Vec<_>>()
        .join("\n");

    let more_text = if summary.failed_steps.len() > 10 {
        format!("\n_...and {} more_", summary.failed_steps.len() - 10)
    } else {
        String::new()
    };

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!(
                    "{} {} / {} - {}",
                    summary.status_emoji,
                    summary.project_name,
                    summary.flow,
                    summary.status.as_str().to_uppercase()
                ),
                "emoji": true
            }
        }),
        json!({
            "type": "section",
            "fields": [
                {
                    "type": "mrkdwn",
                    "text": format!("*Steps:*\n{}", summary.steps)
                },
                {
                    "type": "mrkdwn",
                    "text": format!("*Failed:*\n{}", summary.failed_steps.len())
                },
                {
                    "type": "mrkdwn",
                    "text": format!("*Attempts:*\n{}", summary.attempts)
                },
                {
                    "type": "mrkdwn",
                    "text": format!("*Duration:*\n{}s", summary.duration_seconds)
                }
            ]
        }),
    ];

    if !failed_list.is_empty() {
        blocks.push(json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*Failed steps:*\n{}{}", failed_list, more_text)
            }
        }));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [
            {
                "type": "mrkdwn",
                "text": format!("Run ID: `{}`", summary.run_id)
            }
        ]
    }));

    json!({ "text": summary.text(), "blocks": blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::flow::RunStatus;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn summary(failed: usize) -> NotificationSummary {
        NotificationSummary {
            project_name: "flowcast".into(),
            flow: "publish".into(),
            run_id: "run-1".into(),
            status: if failed == 0 { RunStatus::Succeeded } else { RunStatus::Failed },
            status_emoji: "✅".into(),
            steps: 5,
            failed_steps: (0..failed).map(|i| format!("step {}", i)).collect(),
            attempts: 1,
            duration_seconds: 2,
        }
    }

    async fn notifier(server: &MockServer, channel: Option<&str>) -> SlackNotifier {
        SlackNotifier::new(&config(server, channel)).unwrap()
    }

    fn config(server: &MockServer, channel: Option<&str>) -> SlackConfig {
        SlackConfig {
            webhook_url: format!("{}/services/T/B/X", server.uri()),
            channel: channel.map(str::to_string),
            timeout_seconds: 10,
        }
    }

    #[tokio::test]
    async fn test_notify_posts_text_and_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/T/B/X"))
            .and(body_partial_json(json!({
                "text": "Hello from flowcast!",
                "channel": "#weather"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server, Some("#weather"))
            .await
            .notify("Hello from flowcast!")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_success_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid_token"))
            .mount(&server)
            .await;

        let err = notifier(&server, None).await.notify("hi").await.unwrap_err();
        assert!(err.to_string().contains("invalid_token"));
    }

    #[tokio::test]
    async fn test_hung_webhook_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let notifier = SlackNotifier::with_timeout(&config(&server, None), Duration::from_millis(100)).unwrap();
        let started = std::time::Instant::now();
        let err = notifier.notify("hi").await.unwrap_err();

        assert!(format!("{:#}", err).contains("Slack webhook request failed"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_message_lists_failures() {
        let message = build_run_message(&summary(12));
        let blocks = message["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 4);

        let failed = blocks[2]["text"]["text"].as_str().unwrap();
        assert!(failed.contains("• step 0"));
        assert!(failed.contains("_...and 2 more_"));

        let ok = build_run_message(&summary(0));
        assert_eq!(ok["blocks"].as_array().unwrap().len(), 3);
    }
}
