//! Logging, metrics and the lifecycle event bus.

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{ErrorKind, Event, EventBus, EventEmitter, SequenceOutcome};
pub use logging::{LogFormat, init_logging};
pub use metrics::init_metrics;
