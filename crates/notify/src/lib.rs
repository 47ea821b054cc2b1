//! `notify` crate: fire-and-forget signals to downstream systems.
//!
//! The engine emits a [`Notification`] when a human task is created and
//! when a case reaches a terminal state. Delivery is best-effort: a
//! [`Notifier`] never reports failure back to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Something downstream systems may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    HumanTaskCreated {
        task_id: Uuid,
        case_id: Uuid,
        step_id: String,
        assignee: String,
        due_at: Option<DateTime<Utc>>,
    },
    CaseCompleted {
        case_id: Uuid,
    },
    CaseFailed {
        case_id: Uuid,
        step_id: Option<String>,
        reason: String,
    },
}

impl Notification {
    pub fn case_id(&self) -> Uuid {
        match self {
            Self::HumanTaskCreated { case_id, .. }
            | Self::CaseCompleted { case_id }
            | Self::CaseFailed { case_id, .. } => *case_id,
        }
    }
}

/// Sink for notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes every notification to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match serde_json::to_string(&notification) {
            Ok(json) => info!(case_id = %notification.case_id(), "notification: {json}"),
            Err(e) => warn!("could not serialise notification: {e}"),
        }
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) {}
}

/// Forwards notifications into an unbounded channel, e.g. for a
/// dispatcher task or for test assertions.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification) {
            warn!(case_id = %e.0.case_id(), "notification receiver dropped");
        }
    }
}
