//! Outbound notifications.
//!
//! Engines hand [`Notification`]s to a [`NotificationSink`], which never
//! blocks. The production sink queues them for the background
//! [`Notifier`] worker, which delivers through a
//! [`NotificationTransport`] with bounded retries.

pub mod bridge;
pub mod telegram;
pub mod worker;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::error::NotifyError;

pub use bridge::{BridgeFilter, spawn_bridge};
pub use telegram::TelegramTransport;
pub use worker::{Notifier, RetryPolicy};

/// A message, optionally with a PNG attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Message text, or the photo caption.
    pub text: String,
    /// PNG bytes.
    pub image: Option<Vec<u8>>,
}

impl Notification {
    /// Creates a text-only notification.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    /// Attaches a PNG image.
    #[must_use]
    pub fn with_image(mut self, png: Vec<u8>) -> Self {
        self.image = Some(png);
        self
    }
}

/// Fire-and-forget destination for notifications.
pub trait NotificationSink: Send + Sync {
    /// Accepts a notification without waiting for delivery.
    fn send(&self, notification: Notification);
}

/// Delivery backend used by the worker.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Sends a text message.
    async fn send_message(&self, text: &str) -> Result<(), NotifyError>;

    /// Sends a PNG with a caption.
    async fn send_photo(&self, png: &[u8], caption: &str) -> Result<(), NotifyError>;
}

/// Transport that writes notifications to the log. Used when no bot is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        info!(target: "pixeljack::notify", text, "notification");
        Ok(())
    }

    async fn send_photo(&self, png: &[u8], caption: &str) -> Result<(), NotifyError> {
        info!(target: "pixeljack::notify", caption, bytes = png.len(), "notification with image");
        Ok(())
    }
}

/// Sink that keeps every notification in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    items: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    /// All notifications received so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Texts of all notifications received so far.
    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.notifications().into_iter().map(|n| n.text).collect()
    }
}

impl NotificationSink for CollectingSink {
    fn send(&self, notification: Notification) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}
