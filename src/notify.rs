use std::fmt;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Ms, UserId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user_id: UserId,
    pub message: String,
    pub severity: Severity,
    pub at: Ms,
}

#[derive(Debug, Error)]
#[error("notification to user {user_id} failed: {reason}")]
pub struct NotifyError {
    pub user_id: UserId,
    pub reason: String,
}

/// Fire-and-forget delivery. Callers log failures and carry on.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, user_id: UserId, message: &str, severity: Severity) -> Result<(), NotifyError>;
}

/// Per-user broadcast channels for in-process subscribers (push gateways, tests).
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn unsubscribe_all(&self, user_id: UserId) {
        self.channels.remove(&user_id);
    }
}

impl NotificationSink for NotifyHub {
    /// No-op if nobody is listening for this user.
    fn notify(&self, user_id: UserId, message: &str, severity: Severity) -> Result<(), NotifyError> {
        let Some(sender) = self.channels.get(&user_id) else {
            return Ok(());
        };
        let note = Notification {
            user_id,
            message: message.to_string(),
            severity,
            at: crate::engine::now_ms(),
        };
        // An error here only means every receiver has been dropped.
        let _ = sender.send(note);
        Ok(())
    }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, user_id: UserId, message: &str, severity: Severity) -> Result<(), NotifyError> {
        tracing::info!(user_id, %severity, "notify: {message}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_notification() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(42);
        hub.notify(42, "Booking #1 confirmed", Severity::Success).unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.user_id, 42);
        assert_eq!(got.message, "Booking #1 confirmed");
        assert_eq!(got.severity, Severity::Success);
    }

    #[tokio::test]
    async fn other_users_do_not_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(1);
        hub.notify(2, "not yours", Severity::Info).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notify_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        assert!(hub.notify(5, "nobody home", Severity::Warning).is_ok());
        hub.unsubscribe_all(5);
    }

    #[test]
    fn log_sink_never_fails() {
        assert!(LogSink.notify(9, "Booking #3 expired", Severity::Warning).is_ok());
    }
}
