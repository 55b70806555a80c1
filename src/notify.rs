//! Alert delivery
//!
//! The engine only produces alert text. A `Notifier` carries it somewhere
//! (push service, chat, MQTT) and reports whether delivery succeeded.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::ColorTag;

pub trait Notifier: Send + Sync {
    /// Returns true when the notification was accepted downstream
    fn send(&self, title: &str, message: &str, color: Option<ColorTag>) -> impl Future<Output = bool> + Send;
}

/// Writes alerts to the log; always succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn send(&self, title: &str, message: &str, color: Option<ColorTag>) -> bool {
        let color = color.map_or("none", |c| c.as_str());
        info!(color, "🔔 {} | {}", title, message);
        true
    }
}

/// A notification as seen by [`MemoryNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub title: String,
    pub message: String,
    pub color: Option<ColorTag>,
}

/// Keeps every notification in memory and can be told to fail
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail (nothing is recorded while failing)
    pub async fn set_failing(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

impl Notifier for MemoryNotifier {
    async fn send(&self, title: &str, message: &str, color: Option<ColorTag>) -> bool {
        if *self.failing.lock().await {
            return false;
        }
        self.sent.lock().await.push(SentNotification {
            title: title.to_string(),
            message: message.to_string(),
            color,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_notifier_records_and_fails() {
        let n = MemoryNotifier::new();
        assert!(n.send("a", "b", Some(ColorTag::Green)).await);

        n.set_failing(true).await;
        assert!(!n.send("c", "d", None).await);

        let sent = n.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "a");
        assert_eq!(sent[0].color, Some(ColorTag::Green));
    }

    #[tokio::test]
    async fn test_log_notifier_succeeds() {
        assert!(LogNotifier.send("title", "message", None).await);
    }
}
