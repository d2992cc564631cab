//! Notifications module
//!
//! Provides:
//! - The `Notifier` seam used by pipeline steps
//! - Slack webhook notifications
//! - Run summaries sent after a flow finishes

mod slack;

pub use slack::*;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::config::NotificationsConfig;
use crate::execution::flow::{FlowRun, RunStatus};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;

    /// Report a finished run; plain text unless the channel supports more
    async fn notify_run(&self, summary: &NotificationSummary) -> Result<()> {
        self.notify(&summary.text()).await
    }
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        tracing::info!(target: "flowcast::notify", "{}", message);
        Ok(())
    }
}

/// Keeps messages in memory
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.to_string());
        Ok(())
    }
}

/// Slack when enabled and configured, the log otherwise
pub fn from_config(config: &NotificationsConfig) -> Result<Arc<dyn Notifier>> {
    match (&config.slack, config.enabled) {
        (Some(slack), true) => Ok(Arc::new(SlackNotifier::new(slack)?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Send a run summary if the configuration asks for one
pub async fn send_run_summary(
    config: &NotificationsConfig,
    notifier: &dyn Notifier,
    run: &FlowRun,
    project_name: &str,
) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    // Skip if on_failure is set and the run succeeded
    if config.on_failure && run.status == RunStatus::Succeeded {
        return Ok(());
    }

    notifier.notify_run(&build_summary(run, project_name)).await
}

/// Build a summary message for notifications
pub fn build_summary(run: &FlowRun, project_name: &str) -> NotificationSummary {
    let status_emoji = match run.status {
        RunStatus::Succeeded => "✅",
        RunStatus::PartiallyFailed => "⚠️",
        RunStatus::Cancelled => "⏹️",
        RunStatus::Failed => "❌",
    };

    let failed_steps = run
        .records
        .iter()
        .filter(|r| !r.outcome.is_success())
        .map(|r| r.step.clone())
        .collect();

    NotificationSummary {
        project_name: project_name.to_string(),
        flow: run.flow.clone(),
        run_id: run.run_id.clone(),
        status: run.status,
        status_emoji: status_emoji.to_string(),
        steps: run.records.len(),
        failed_steps,
        attempts: run.attempts,
        duration_seconds: run.duration_ms() / 1000,
    }
}

#[derive(Debug, Clone)]
pub struct NotificationSummary {
    pub project_name: String,
    pub flow: String,
    pub run_id: String,
    pub status: RunStatus,
    pub status_emoji: String,
    pub steps: usize,
    pub failed_steps: Vec<String>,
    pub attempts: u32,
    pub duration_seconds: i64,
}

impl NotificationSummary {
    pub fn text(&self) -> String {
        let mut text = format!(
            "{} {} / {}: {} ({} steps, {}s)",
            self.status_emoji,
            self.project_name,
            self.flow,
            self.status.as_str().to_uppercase(),
            self.steps,
            self.duration_seconds
        );
        if !self.failed_steps.is_empty() {
            text.push_str(&format!("\nFailed: {}", self.failed_steps.join(", ")));
        }
        text
    }
}
