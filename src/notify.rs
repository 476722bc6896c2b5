use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Activated,
    ExpiringSoon,
    Expired,
}

/// Outbound state-transition event handed to the notification collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub user_id: i64,
    pub kind: NotificationKind,
    pub plan_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> Result<()>;
}

/// Default sink for the daemon; the bot layer replaces this with its own
/// delivery channel.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<()> {
        info!(
            user_id = event.user_id,
            kind = ?event.kind,
            plan = %event.plan_id,
            "subscription notification"
        );
        Ok(())
    }
}

/// Channel-backed notifier used by tests and embedding collaborators.
pub struct ChannelNotifier {
    sender: Sender<NotificationEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, Receiver<NotificationEvent>) {
        let (sender, receiver) = channel(capacity);
        (ChannelNotifier { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|err| anyhow!("failed to deliver notification event: {err}"))
    }
}
