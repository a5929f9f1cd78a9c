use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Notifications kept per user for polling clients; oldest are dropped first.
pub const INBOX_CAPACITY: usize = 50;

/// A message addressed to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Ulid,
    pub title: String,
    pub message: String,
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier unavailable: {0}")]
    Unavailable(String),
    #[error("delivery to {user_id} failed: {reason}")]
    Delivery { user_id: Ulid, reason: String },
}

/// Outbound side effect for booking changes. Callers treat every error as
/// non-fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: Ulid,
        title: &str,
        message: &str,
        url: Option<&str>,
    ) -> Result<(), NotifyError>;
}

/// In-process hub: a bounded inbox per user, read by polling.
pub struct NotifyHub {
    inboxes: DashMap<Ulid, VecDeque<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
        }
    }

    /// A user's notifications, newest first.
    pub fn recent(&self, user_id: Ulid) -> Vec<Notification> {
        self.inboxes
            .get(&user_id)
            .map(|inbox| inbox.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(
        &self,
        user_id: Ulid,
        title: &str,
        message: &str,
        url: Option<&str>,
    ) -> Result<(), NotifyError> {
        let notification = Notification {
            user_id,
            title: title.to_string(),
            message: message.to_string(),
            url: url.map(str::to_string),
        };
        let mut inbox = self.inboxes.entry(user_id).or_default();
        if inbox.len() == INBOX_CAPACITY {
            inbox.pop_front();
        }
        inbox.push_back(notification);
        Ok(())
    }
}
