//! Push channel towards the presentation layer.

use localdb_store::DatabaseInstance;
use serde::Serialize;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::warn;

use crate::tasks::AsyncTask;

pub const INSTALL_PROGRESS: &str = "install-progress";
pub const INSTANCES_UPDATED: &str = "instances-updated";

const DEFAULT_CAPACITY: usize = 256;

/// Notification pushed to subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "channel", content = "payload", rename_all = "kebab-case")]
pub enum Notification {
    /// Current snapshot of an install or uninstall task.
    InstallProgress(AsyncTask),
    /// Full instance list after a lifecycle change.
    InstancesUpdated(Vec<DatabaseInstance>),
}

impl Notification {
    pub fn channel(&self) -> &'static str {
        match self {
            Notification::InstallProgress(_) => INSTALL_PROGRESS,
            Notification::InstancesUpdated(_) => INSTANCES_UPDATED,
        }
    }
}

/// Tokio broadcast-backed hub shared by the registry and the task engine.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: Sender<Notification>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fans the notification out. Returns the number of subscribers reached;
    /// publishing with nobody listening is not an error.
    pub fn publish(&self, notification: Notification) -> usize {
        self.sender.send(notification).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Handle returned to subscribers.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<Notification>,
}

impl Subscription {
    /// Waits for the next notification. A subscriber that fell behind skips
    /// the dropped messages and keeps receiving; `None` means the hub is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; dropping notifications");
                }
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.try_recv() {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; dropping notifications");
                }
                Err(_) => return None,
            }
        }
    }
}
