//! Forwards selected lifecycle events as notifications.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Notification, NotificationSink};
use crate::observability::{ErrorKind, Event, EventBus};

/// Which events are forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeFilter {
    /// Forward [`Event::TriggerOnset`].
    pub trigger_onset: bool,
    /// Forward [`Event::SequenceCompleted`].
    pub sequence_completed: bool,
    /// Forward [`Event::ErrorOccurred`], except notification failures.
    pub errors: bool,
}

impl BridgeFilter {
    /// `true` if nothing would be forwarded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.trigger_onset || self.sequence_completed || self.errors)
    }

    /// Notification text for `event`, or `None` if it is filtered out.
    #[must_use]
    pub fn render(&self, event: &Event) -> Option<String> {
        match event {
            Event::TriggerOnset {
                template, x, y, ..
            } if self.trigger_onset => Some(format!("▶️ trigger '{template}' at ({x}, {y})")),
            Event::SequenceCompleted {
                outcome,
                duration_ms,
                ..
            } if self.sequence_completed => {
                #[allow(clippy::cast_precision_loss)]
                let secs = *duration_ms as f64 / 1000.0;
                Some(format!("sequence {} in {secs:.1}s", outcome.as_str()))
            }
            // a notification failure must not produce another notification
            Event::ErrorOccurred { kind, message, .. }
                if self.errors && *kind != ErrorKind::Notification =>
            {
                Some(format!("⚠️ {} error: {message}", kind.as_str()))
            }
            _ => None,
        }
    }
}

/// Subscribes to `events` and forwards matching events to `sink` until
/// `cancel` fires. Events already buffered when `cancel` fires are still
/// forwarded.
#[must_use]
pub fn spawn_bridge(
    events: &EventBus,
    sink: Arc<dyn NotificationSink>,
    filter: BridgeFilter,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut stream = BroadcastStream::new(events.subscribe());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                item = stream.next() => {
                    if !forward(item, filter, sink.as_ref()) {
                        break;
                    }
                }
                () = cancel.cancelled() => {
                    tokio::task::unconstrained(drain(&mut stream, filter, sink.as_ref())).await;
                    break;
                }
            }
        }
        debug!("event bridge exited");
    })
}

/// Handles one stream item. Returns `false` once the bus is closed.
fn forward(
    item: Option<Result<Event, BroadcastStreamRecvError>>,
    filter: BridgeFilter,
    sink: &dyn NotificationSink,
) -> bool {
    match item {
        Some(Ok(event)) => {
            if let Some(text) = filter.render(&event) {
                debug!(event = event.name(), "forwarding event");
                sink.send(Notification::text(text));
            }
            true
        }
        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
            warn!(skipped, "event bridge lagged, events not forwarded");
            true
        }
        None => false,
    }
}

/// Forwards whatever is buffered without waiting for more.
async fn drain(
    stream: &mut BroadcastStream<Event>,
    filter: BridgeFilter,
    sink: &dyn NotificationSink,
) {
    loop {
        tokio::select! {
            biased;
            item = stream.next() => {
                if !forward(item, filter, sink) {
                    return;
                }
            }
            () = std::future::ready(()) => return,
        }
    }
}
