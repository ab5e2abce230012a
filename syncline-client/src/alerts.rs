//! Transient, non-blocking alerts raised by realtime inserts.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Sending half of the alert queue.
///
/// Alerts are dropped when the queue is full or nobody is listening; the
/// event-processing loop never waits on the UI.
#[derive(Debug, Clone)]
pub struct AlertSink {
    sender: mpsc::Sender<Alert>,
}

impl AlertSink {
    /// Create a sink and the receiver the UI drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Returns false if the alert was dropped.
    pub fn raise(&self, alert: Alert) -> bool {
        match self.sender.try_send(alert) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "alert dropped");
                false
            }
        }
    }
}
