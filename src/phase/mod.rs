//! Clicker engine.
//!
//! A trigger template starts an ordered phase sequence; when the sequence
//! ends (or aborts) trigger polling resumes.
//!
//! # Architecture
//!
//! - [`EngineState`]: `Idle | Polling | Sequencing(SequenceRun)` with central transition checks
//! - [`TriggerWatcher`]: polls for trigger templates, latched until re-armed
//! - [`PhaseSequencer`]: evaluates one phase per tick
//! - [`ClickerEngine`]: owns all of the above and implements [`Scheduled`](crate::scheduler::Scheduled)

pub mod engine;
pub mod sequencer;
pub mod state;
pub mod trigger;

pub use engine::ClickerEngine;
pub use sequencer::{Phase, PhaseAction, PhaseSequencer, Step};
pub use state::{EngineState, EngineStatus, SequenceRun};
pub use trigger::{TriggerResult, TriggerWatcher};
