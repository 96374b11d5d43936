//! Terminal-state notifications (emails and the like are sent elsewhere).

use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use domain::ShopperId;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Confirmed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub attempt_id: AggregateId,
    pub shopper_id: Option<ShopperId>,
    pub kind: NotificationKind,
    pub order_id: Option<AggregateId>,
}

/// Receiver of terminal order states. Fire-and-forget: delivery problems
/// are the sink's business and never fail a transition.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Logs each notification.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationSink for LoggingNotifier {
    async fn notify(&self, notification: Notification) {
        tracing::info!(
            attempt_id = %notification.attempt_id,
            kind = ?notification.kind,
            "order notification"
        );
    }
}

/// Keeps every notification for inspection in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn count(&self, attempt_id: AggregateId, kind: NotificationKind) -> usize {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.attempt_id == attempt_id && n.kind == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().await.push(notification);
    }
}
