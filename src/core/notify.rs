//! Completion notification
//!
//! The coordinator calls a [`Notifier`] once when every worker of a run has
//! finished. Delivery (mail, chat, a log line) is up to the implementation.

use super::logger::EventLog;
use thiserror::Error;

/// Notification delivery failure
#[derive(Error, Debug)]
pub enum NotifyError {
    /// No recipient configured
    #[error("No notification recipient configured")]
    NoRecipient,

    /// The backend refused the message
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Delivers completion notices
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    /// Send one notice
    fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<(), NotifyError>;
}

/// Writes notices to the event log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    log: EventLog,
}

impl LogNotifier {
    /// Notifier writing to `log`
    pub fn new(log: EventLog) -> Self {
        Self {
            log: log.scoped("notify"),
        }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<(), NotifyError> {
        let to = if recipient.is_empty() { "operator" } else { recipient };
        self.log.info(format!("to {}: {}", to, subject));
        for line in body.lines() {
            self.log.info(format!("  {}", line));
        }
        Ok(())
    }
}
