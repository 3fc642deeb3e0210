//! Clicker state machine.
//!
//! The engine is exactly one of `Idle`, `Polling` (trigger watcher active)
//! or `Sequencing` (a [`SequenceRun`] is active). Holding the run inside
//! the enum makes "polling while sequencing" unrepresentable; the legal
//! edges are checked in one place, [`EngineState::transition`].

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::PhaseError;

/// Mutable state of one pass through the phase list.
///
/// Owned by the engine's state and only touched from its control loop.
#[derive(Debug, Clone)]
pub struct SequenceRun {
    run_id: Uuid,
    phase_index: usize,
    /// Ticks left before a `WaitThenAct` phase searches. `None` until armed.
    pub(crate) wait_counter: Option<u32>,
    /// First tick seen in the current phase.
    pub(crate) phase_started_at: Option<Instant>,
    /// Last 30-second bucket logged by a fixed wait.
    pub(crate) progress_bucket: u64,
    started_at: Instant,
}

impl SequenceRun {
    /// Starts a run at phase 0.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            phase_index: 0,
            wait_counter: None,
            phase_started_at: None,
            progress_bucket: 0,
            started_at: now,
        }
    }

    /// Identifier carried by every event of this run.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Index of the phase being evaluated.
    #[must_use]
    pub const fn phase_index(&self) -> usize {
        self.phase_index
    }

    /// When the run started.
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Moves to the next phase and clears per-phase bookkeeping.
    ///
    /// The index only ever grows within a run.
    pub fn advance(&mut self) -> usize {
        self.phase_index += 1;
        self.wait_counter = None;
        self.phase_started_at = None;
        self.progress_bucket = 0;
        self.phase_index
    }

    /// Records the first tick of the current phase and returns when it was.
    pub fn phase_started(&mut self, now: Instant) -> Instant {
        *self.phase_started_at.get_or_insert(now)
    }
}

/// Clicker engine state.
#[derive(Debug, Clone, Default)]
pub enum EngineState {
    /// Not running; no timers pending.
    #[default]
    Idle,
    /// Polling trigger templates.
    Polling,
    /// Walking the phase list; trigger polling is paused.
    Sequencing(SequenceRun),
}

/// Copyable summary of [`EngineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Not running.
    Idle,
    /// Polling trigger templates.
    Polling,
    /// Running a sequence, currently at `phase_index`.
    Sequencing {
        /// Current phase.
        phase_index: usize,
    },
}

impl EngineState {
    /// State name for logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Sequencing(_) => "sequencing",
        }
    }

    /// `true` unless idle.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Summary of the current state.
    #[must_use]
    pub const fn status(&self) -> EngineStatus {
        match self {
            Self::Idle => EngineStatus::Idle,
            Self::Polling => EngineStatus::Polling,
            Self::Sequencing(run) => EngineStatus::Sequencing {
                phase_index: run.phase_index,
            },
        }
    }

    /// Replaces the state if the edge is legal and returns the previous one.
    ///
    /// Legal edges: `Idle -> Polling`, `Polling -> Sequencing`,
    /// `Sequencing -> Polling`, and any running state `-> Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidTransition`] and leaves the state
    /// untouched for any other edge.
    pub fn transition(&mut self, next: Self) -> Result<Self, PhaseError> {
        let legal = matches!(
            (&*self, &next),
            (Self::Idle, Self::Polling)
                | (Self::Polling, Self::Sequencing(_))
                | (Self::Sequencing(_), Self::Polling)
                | (Self::Polling | Self::Sequencing(_), Self::Idle)
        );
        if !legal {
            return Err(PhaseError::InvalidTransition(format!(
                "{} -> {}",
                self.name(),
                next.name()
            )));
        }
        Ok(std::mem::replace(self, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_cycle() {
        let now = Instant::now();
        let mut state = EngineState::Idle;
        state.transition(EngineState::Polling).unwrap();
        state
            .transition(EngineState::Sequencing(SequenceRun::new(now)))
            .unwrap();
        assert_eq!(state.status(), EngineStatus::Sequencing { phase_index: 0 });
        let prev = state.transition(EngineState::Polling).unwrap();
        assert!(matches!(prev, EngineState::Sequencing(_)));
        state.transition(EngineState::Idle).unwrap();
        assert!(!state.is_running());
    }

    #[test]
    fn sequencing_requires_polling_first() {
        let mut state = EngineState::Idle;
        let err = state
            .transition(EngineState::Sequencing(SequenceRun::new(Instant::now())))
            .unwrap_err();
        assert!(err.to_string().contains("idle -> sequencing"));
        assert_eq!(state.status(), EngineStatus::Idle);
    }

    #[test]
    fn idle_to_idle_and_polling_to_polling_are_rejected() {
        let mut state = EngineState::Idle;
        assert!(state.transition(EngineState::Idle).is_err());
        state.transition(EngineState::Polling).unwrap();
        assert!(state.transition(EngineState::Polling).is_err());
    }

    #[test]
    fn advance_is_monotonic_and_resets_phase_fields() {
        let now = Instant::now();
        let mut run = SequenceRun::new(now);
        run.wait_counter = Some(3);
        run.phase_started(now);
        assert_eq!(run.advance(), 1);
        assert_eq!(run.advance(), 2);
        assert!(run.wait_counter.is_none());
        assert!(run.phase_started_at.is_none());
    }
}
