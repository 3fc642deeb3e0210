//! Structured lifecycle events.
//!
//! Engines publish [`Event`]s on an [`EventBus`]. The bus fans out to
//! in-process subscribers (notification bridge, tests) over a
//! `tokio::sync::broadcast` channel and, optionally, to a JSONL
//! [`EventEmitter`] that stamps each line with a monotonically increasing
//! sequence number.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::platform::{ClickType, Key};

// ---------------------------------------------------------------------------
// Event variants
// ---------------------------------------------------------------------------

/// Failure category carried by [`Event::ErrorOccurred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Template unreadable or larger than the region.
    Asset,
    /// Screen grab failed.
    Capture,
    /// Matcher failed for one template variant.
    Match,
    /// Mouse or keyboard injection failed.
    Input,
    /// A phase failed and the sequence was aborted.
    Sequence,
    /// A notification was dropped after its retries ran out.
    Notification,
}

impl ErrorKind {
    /// Stable lowercase name, also used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Capture => "capture",
            Self::Match => "match",
            Self::Input => "input",
            Self::Sequence => "sequence",
            Self::Notification => "notification",
        }
    }
}

/// How a sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceOutcome {
    /// Every phase finished.
    Completed,
    /// A phase failed; polling was resumed.
    Aborted,
}

impl SequenceOutcome {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

/// A discrete event emitted during operation.
///
/// Serialized with a `"type"` tag so consumers can dispatch on the kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// An engine was started.
    EngineStarted {
        /// When it started.
        timestamp: DateTime<Utc>,
        /// Engine name (`clicker`, `alert`, `keys:space`, ...).
        engine: String,
    },

    /// An engine was stopped.
    EngineStopped {
        /// When it stopped.
        timestamp: DateTime<Utc>,
        /// Engine name.
        engine: String,
    },

    /// A trigger template was seen and the sequence is being handed control.
    TriggerOnset {
        /// When the trigger matched.
        timestamp: DateTime<Utc>,
        /// Label of the template that matched.
        template: String,
        /// Click x.
        x: i32,
        /// Click y.
        y: i32,
        /// Match confidence.
        confidence: f32,
    },

    /// A click was injected on a matched image.
    ImageClicked {
        /// When the click happened.
        timestamp: DateTime<Utc>,
        /// Screen x.
        x: i32,
        /// Screen y.
        y: i32,
        /// Single or double.
        click: ClickType,
    },

    /// A phase sequence began.
    SequenceStarted {
        /// When the sequence began.
        timestamp: DateTime<Utc>,
        /// Identifier shared by all events of this run.
        run_id: Uuid,
        /// Number of phases.
        phases: usize,
    },

    /// A phase finished and the sequence moved on.
    SequenceStep {
        /// When the phase finished.
        timestamp: DateTime<Utc>,
        /// Run identifier.
        run_id: Uuid,
        /// Zero-based index of the finished phase.
        phase_index: usize,
        /// Name of the finished phase.
        phase_name: String,
        /// Human-readable description, e.g. `"phase 0 complete"`.
        description: String,
    },

    /// Progress through a fixed wait.
    PhaseProgress {
        /// When progress was sampled.
        timestamp: DateTime<Utc>,
        /// Run identifier.
        run_id: Uuid,
        /// Index of the waiting phase.
        phase_index: usize,
        /// Seconds elapsed, never above `total_secs`.
        elapsed_secs: f64,
        /// Total wait in seconds.
        total_secs: f64,
    },

    /// A sequence ended and trigger polling resumed.
    SequenceCompleted {
        /// When the sequence ended.
        timestamp: DateTime<Utc>,
        /// Run identifier.
        run_id: Uuid,
        /// Completed or aborted.
        outcome: SequenceOutcome,
        /// Wall time of the run in milliseconds.
        duration_ms: u64,
    },

    /// A failure was absorbed.
    ErrorOccurred {
        /// When the failure happened.
        timestamp: DateTime<Utc>,
        /// Failure category.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },

    /// A presence detector saw its marker appear.
    UserDetected {
        /// When the edge fired.
        timestamp: DateTime<Utc>,
        /// Detector name.
        detector: String,
        /// Notification text.
        message: String,
        /// Raw measurement (matching pixels, or 1 for a template hit).
        count: u32,
    },

    /// A presence detector saw its marker disappear.
    UserDisappeared {
        /// When the edge fired.
        timestamp: DateTime<Utc>,
        /// Detector name.
        detector: String,
        /// Notification text.
        message: String,
    },

    /// A repeat alert was sent while the marker stayed present.
    AlertRepeated {
        /// When it was sent.
        timestamp: DateTime<Utc>,
        /// Detector name.
        detector: String,
        /// One-based repeat number.
        repeat: u32,
        /// Configured maximum.
        max: u32,
    },

    /// A key press cycle finished.
    KeyPressed {
        /// When the last press happened.
        timestamp: DateTime<Utc>,
        /// Key that was pressed.
        key: Key,
        /// Presses in the cycle.
        presses: u32,
    },
}

impl Event {
    /// Builds an [`Event::ErrorOccurred`] stamped now.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::ErrorOccurred {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        }
    }

    /// Variant name, identical to the serialized `"type"` tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EngineStarted { .. } => "EngineStarted",
            Self::EngineStopped { .. } => "EngineStopped",
            Self::TriggerOnset { .. } => "TriggerOnset",
            Self::ImageClicked { .. } => "ImageClicked",
            Self::SequenceStarted { .. } => "SequenceStarted",
            Self::SequenceStep { .. } => "SequenceStep",
            Self::PhaseProgress { .. } => "PhaseProgress",
            Self::SequenceCompleted { .. } => "SequenceCompleted",
            Self::ErrorOccurred { .. } => "ErrorOccurred",
            Self::UserDetected { .. } => "UserDetected",
            Self::UserDisappeared { .. } => "UserDisappeared",
            Self::AlertRepeated { .. } => "AlertRepeated",
            Self::KeyPressed { .. } => "KeyPressed",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope (adds sequence number via serde flatten)
// ---------------------------------------------------------------------------

/// Wraps an [`Event`] with a monotonically increasing sequence number.
#[derive(Debug, Serialize)]
struct EventEnvelope<'a> {
    /// Zero-based, monotonically increasing sequence counter.
    sequence: u64,
    /// The wrapped event (flattened into the same JSON object).
    #[serde(flatten)]
    event: &'a Event,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Thread-safe, buffered JSONL event writer.
///
/// Serialization or I/O failures are silently dropped because
/// observability must never stop an engine.
pub struct EventEmitter {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
    sequence: AtomicU64,
}

// Box<dyn Write> is not Debug
impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    /// Creates an emitter that writes to the given writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
            sequence: AtomicU64::new(0),
        }
    }

    /// Creates an emitter that writes to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Creates an emitter that writes to a file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or opened.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }

    /// Writes an event as a single JSONL line.
    pub fn emit(&self, event: &Event) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = EventEnvelope {
            sequence: seq,
            event,
        };

        if let Ok(mut w) = self.writer.lock() {
            if let Ok(line) = serde_json::to_string(&envelope) {
                let _ = writeln!(w, "{line}");
                let _ = w.flush();
            }
        }
    }

    /// Returns the number of events emitted so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Capacity of the broadcast ring; slow subscribers see `Lagged`.
const BUS_CAPACITY: usize = 1024;

/// Fan-out point for every engine's events.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    emitter: Option<EventEmitter>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with no JSONL output.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx, emitter: None }
    }

    /// Creates a bus that also writes every event through `emitter`.
    #[must_use]
    pub fn with_emitter(emitter: EventEmitter) -> Self {
        Self {
            emitter: Some(emitter),
            ..Self::new()
        }
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(&event);
        }
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
