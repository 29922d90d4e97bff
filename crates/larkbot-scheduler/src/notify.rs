//! Failure notifications: formats a human-readable summary, sends it
//! through the message sender and keeps a short history.

use chrono::{DateTime, Utc};
use larkbot_core::error::Result;
use larkbot_core::traits::MessageSender;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MAX_NOTIFICATIONS: usize = 100;

/// A notification that was sent (or attempted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: NotifyPriority,
    /// Task or rule that produced it.
    pub source: String,
    pub target: String,
    pub delivered: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Text sent when a task has exhausted its retries.
pub fn permanent_failure_message(task_name: &str, error: &str) -> String {
    format!("Task '{task_name}' failed permanently after all retries. Error: {error}")
}

/// Text sent by the executor's `notify` policy for a single failed run.
pub fn run_failure_message(task_name: &str, error: &str) -> String {
    format!("Task '{task_name}' failed. Error: {error}")
}

/// Sends notifications and remembers the last 100.
pub struct Notifier {
    sender: Arc<dyn MessageSender>,
    history: Mutex<VecDeque<Notification>>,
}

impl Notifier {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            sender,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Send `body` to `target` and record the attempt.
    pub async fn notify(
        &self,
        target: &str,
        title: &str,
        body: &str,
        source: &str,
        priority: NotifyPriority,
    ) -> Result<()> {
        let outcome = self.sender.send_text(body, target).await;
        match &outcome {
            Ok(()) => tracing::info!("📢 Notification sent to '{target}': {title}"),
            Err(e) => tracing::warn!("⚠️ Notification to '{target}' failed: {e}"),
        }
        self.record(Notification {
            title: title.to_string(),
            body: body.to_string(),
            priority,
            source: source.to_string(),
            target: target.to_string(),
            delivered: outcome.is_ok(),
            timestamp: Utc::now(),
        });
        outcome
    }

    /// Permanent failure after all retries.
    pub async fn task_failed_permanently(&self, task_name: &str, error: &str, target: &str) -> Result<()> {
        let body = permanent_failure_message(task_name, error);
        self.notify(target, "Task failed permanently", &body, task_name, NotifyPriority::High)
            .await
    }

    /// One failed run.
    pub async fn task_failed(&self, task_name: &str, error: &str, target: &str) -> Result<()> {
        let body = run_failure_message(task_name, error);
        self.notify(target, "Task failed", &body, task_name, NotifyPriority::Normal)
            .await
    }

    fn record(&self, notification: Notification) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(notification);
        // ring buffer, last 100
        while history.len() > MAX_NOTIFICATIONS {
            history.pop_front();
        }
    }

    /// Notification history, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
