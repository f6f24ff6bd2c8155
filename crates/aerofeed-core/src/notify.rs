//! Diagnostic notifications raised by the core for the surrounding application.
//!
//! Notifications are broadcast to live subscribers and also kept as
//! "outstanding" until dismissed, so a consumer that attaches late still sees
//! that a circuit opened or a cache namespace lost its persistent tier.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::UtcDateTime;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A service reached its failure threshold and is disabled until reset.
    CircuitOpened {
        service: String,
        consecutive_failures: u32,
        last_error: String,
        at: UtcDateTime,
    },
    /// A cache namespace fell back to memory-only storage.
    PersistenceDegraded {
        namespace: String,
        reason: String,
        at: UtcDateTime,
    },
}

impl Notification {
    /// Service or namespace the notification is about.
    pub fn subject(&self) -> &str {
        match self {
            Self::CircuitOpened { service, .. } => service,
            Self::PersistenceDegraded { namespace, .. } => namespace,
        }
    }

    fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug)]
struct NotifierInner {
    tx: broadcast::Sender<Notification>,
    outstanding: Mutex<Vec<Notification>>,
}

/// Cloneable handle for publishing and observing notifications.
#[derive(Debug, Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(NotifierInner {
                tx,
                outstanding: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Records the notification as outstanding (replacing an older one of the
    /// same kind and subject) and broadcasts it.
    pub fn publish(&self, notification: Notification) {
        {
            let mut outstanding = self
                .inner
                .outstanding
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            outstanding.retain(|existing| {
                !(existing.same_kind(&notification) && existing.subject() == notification.subject())
            });
            outstanding.push(notification.clone());
        }

        // No subscribers is fine; the notification stays outstanding.
        let _ = self.inner.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.tx.subscribe()
    }

    pub fn outstanding(&self) -> Vec<Notification> {
        self.inner
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drops every outstanding notification about `subject`; returns how many were removed.
    pub fn dismiss(&self, subject: &str) -> usize {
        let mut outstanding = self
            .inner
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = outstanding.len();
        outstanding.retain(|existing| existing.subject() != subject);
        before - outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(service: &str, failures: u32) -> Notification {
        Notification::CircuitOpened {
            service: service.to_owned(),
            consecutive_failures: failures,
            last_error: String::from("timeout"),
            at: UtcDateTime::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_notifications() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();

        notifier.publish(opened("weather", 3));

        let received = rx.recv().await.expect("notification delivered");
        assert_eq!(received.subject(), "weather");
    }

    #[test]
    fn outstanding_keeps_latest_per_subject_until_dismissed() {
        let notifier = Notifier::default();
        notifier.publish(opened("weather", 3));
        notifier.publish(opened("weather", 4));
        notifier.publish(opened("traffic", 3));

        assert_eq!(notifier.outstanding().len(), 2);
        assert_eq!(notifier.dismiss("weather"), 1);
        assert_eq!(notifier.outstanding().len(), 1);
        assert_eq!(notifier.outstanding()[0].subject(), "traffic");
    }
}
