//! Background delivery worker.
//!
//! One tokio task owns the transport and drains an unbounded queue in
//! order. A failed delivery is retried with exponential backoff up to
//! [`RetryPolicy::max_attempts`], then dropped; a slow or failing send
//! only delays later notifications, it never blocks the sender.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Notification, NotificationSink, NotificationTransport};
use crate::observability::{ErrorKind, Event, EventBus, metrics};

/// Default delivery attempts per notification.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default ceiling for retry delays.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Bounded retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per notification, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure.
    pub initial_backoff: Duration,
    /// Ceiling for the delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

enum Command {
    Deliver(Notification),
    Drain(oneshot::Sender<()>),
}

/// Queueing sink handed to engines.
#[derive(Debug, Clone)]
struct QueueSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl NotificationSink for QueueSink {
    fn send(&self, notification: Notification) {
        if self.tx.send(Command::Deliver(notification)).is_err() {
            warn!("notification worker has shut down, message dropped");
            metrics::record_notification("dropped");
        }
    }
}

/// Handle to the delivery worker.
#[derive(Debug)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Command>,
    join: JoinHandle<()>,
}

impl Notifier {
    /// Spawns the worker. Dropped notifications are reported on `events`
    /// when given.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn NotificationTransport>,
        policy: RetryPolicy,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            max_attempts: policy.max_attempts.max(1),
            ..policy
        };
        info!(
            transport = transport.name(),
            max_attempts = policy.max_attempts,
            "notification worker started"
        );
        let join = tokio::spawn(run(transport, policy, events, rx));
        Self { tx, join }
    }

    /// A cloneable, non-blocking sink feeding this worker.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn NotificationSink> {
        Arc::new(QueueSink {
            tx: self.tx.clone(),
        })
    }

    /// Delivers everything queued so far, then stops the worker.
    ///
    /// Returns `false` if `grace` ran out first; undelivered messages are
    /// abandoned in that case.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Drain(done_tx)).is_err() {
            return self.join.await.is_ok();
        }
        if let Ok(Ok(())) = tokio::time::timeout(grace, done_rx).await {
            debug!("notification queue drained");
            let _ = self.join.await;
            true
        } else {
            warn!(?grace, "notification drain timed out, pending messages abandoned");
            self.join.abort();
            false
        }
    }
}

async fn run(
    transport: Arc<dyn NotificationTransport>,
    policy: RetryPolicy,
    events: Option<Arc<EventBus>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Deliver(notification) => {
                deliver(transport.as_ref(), &policy, events.as_deref(), &notification).await;
            }
            Command::Drain(done) => {
                let _ = done.send(());
                break;
            }
        }
    }
    debug!("notification worker exited");
}

async fn deliver(
    transport: &dyn NotificationTransport,
    policy: &RetryPolicy,
    events: Option<&EventBus>,
    notification: &Notification,
) {
    for attempt in 1..=policy.max_attempts {
        let result = match &notification.image {
            Some(png) => transport.send_photo(png, &notification.text).await,
            None => transport.send_message(&notification.text).await,
        };
        match result {
            Ok(()) => {
                debug!(attempt, "notification sent");
                metrics::record_notification("sent");
                return;
            }
            Err(e) if attempt < policy.max_attempts => {
                let wait = policy.backoff(attempt);
                warn!(attempt, error = %e, ?wait, "notification failed, retrying");
                metrics::record_notification("retried");
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                warn!(attempts = attempt, error = %e, "notification dropped");
                metrics::record_notification("dropped");
                metrics::record_error(ErrorKind::Notification);
                if let Some(events) = events {
                    events.emit(Event::error(
                        ErrorKind::Notification,
                        format!("dropped after {attempt} attempts: {e}"),
                    ));
                }
            }
        }
    }
}
