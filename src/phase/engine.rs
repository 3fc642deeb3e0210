//! Clicker engine.
//!
//! Owns the [`EngineState`] and dispatches each tick either to the
//! [`TriggerWatcher`] (while polling) or to the [`PhaseSequencer`] (while
//! a sequence runs). The two are mutually exclusive because the state
//! enum holds exactly one of them as active.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::observability::{ErrorKind, Event, EventBus, SequenceOutcome, metrics};
use crate::platform::{InputInjector, ScreenCapture};
use crate::scheduler::Scheduled;
use crate::vision::{MatchResult, TemplateMatcher};

use super::sequencer::{Io, PhaseSequencer, Step};
use super::state::{EngineState, EngineStatus, SequenceRun};
use super::trigger::{TriggerResult, TriggerWatcher};

/// Engine name used in events, logs and metrics.
pub const CLICKER: &str = "clicker";

/// Trigger-then-sequence automation engine.
pub struct ClickerEngine {
    state: EngineState,
    watcher: TriggerWatcher,
    sequencer: PhaseSequencer,
    matcher: TemplateMatcher,
    capture: Box<dyn ScreenCapture>,
    input: Box<dyn InputInjector>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for ClickerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickerEngine")
            .field("state", &self.state)
            .field("watcher", &self.watcher)
            .field("phases", &self.sequencer.len())
            .finish_non_exhaustive()
    }
}

impl ClickerEngine {
    /// Creates an idle engine.
    #[must_use]
    pub fn new(
        watcher: TriggerWatcher,
        sequencer: PhaseSequencer,
        matcher: TemplateMatcher,
        capture: Box<dyn ScreenCapture>,
        input: Box<dyn InputInjector>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            state: EngineState::Idle,
            watcher,
            sequencer,
            matcher,
            capture,
            input,
            events,
        }
    }

    /// Current state summary.
    #[must_use]
    pub const fn status(&self) -> EngineStatus {
        self.state.status()
    }

    /// Applies a state change. Illegal edges are logged and ignored.
    fn set_state(&mut self, next: EngineState) -> Option<EngineState> {
        match self.state.transition(next) {
            Ok(previous) => {
                debug!(from = previous.name(), to = self.state.name(), "state transition");
                metrics::set_engine_state(self.state.name(), Some(previous.name()));
                Some(previous)
            }
            Err(e) => {
                warn!(error = %e, "transition ignored");
                None
            }
        }
    }

    fn report(&self, kind: ErrorKind, message: String) {
        metrics::record_error(kind);
        self.events.emit(Event::error(kind, message));
    }

    fn poll_trigger(&mut self, now: Instant) -> Instant {
        let next_poll = now + self.watcher.interval();
        let started = std::time::Instant::now();
        metrics::record_poll(CLICKER);

        let frame = match self.capture.grab(self.watcher.region()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "trigger capture failed, retrying next poll");
                self.report(ErrorKind::Capture, e.to_string());
                return next_poll;
            }
        };
        let result = self.watcher.poll(&frame, &self.matcher);
        metrics::record_capture_duration(CLICKER, started.elapsed());

        match result {
            TriggerResult::Fired(m) => self.hand_off(&m, now),
            TriggerResult::NotMet => next_poll,
            TriggerResult::Latched => {
                debug!("trigger latched, poll ignored");
                next_poll
            }
        }
    }

    /// Clicks the trigger and starts a sequence.
    fn hand_off(&mut self, m: &MatchResult, now: Instant) -> Instant {
        let at = m.center();
        let click = self.watcher.click();
        if let Err(e) = self.input.click_at(at, click) {
            warn!(error = %e, "trigger click failed, staying in polling");
            self.report(ErrorKind::Input, e.to_string());
            self.watcher.rearm();
            return now + self.watcher.interval();
        }

        info!(template = %m.template, x = at.x, y = at.y, confidence = m.confidence, "trigger onset");
        metrics::record_trigger_onset();
        self.events.emit(Event::TriggerOnset {
            timestamp: Utc::now(),
            template: m.template.clone(),
            x: at.x,
            y: at.y,
            confidence: m.confidence,
        });
        metrics::record_click(click);
        self.events.emit(Event::ImageClicked {
            timestamp: Utc::now(),
            x: at.x,
            y: at.y,
            click,
        });

        let run = SequenceRun::new(now);
        let run_id = run.run_id();
        if self.set_state(EngineState::Sequencing(run)).is_none() {
            self.watcher.rearm();
            return now + self.watcher.interval();
        }
        info!(%run_id, phases = self.sequencer.len(), "sequence started");
        self.events.emit(Event::SequenceStarted {
            timestamp: Utc::now(),
            run_id,
            phases: self.sequencer.len(),
        });
        now + self.sequencer.tick_interval()
    }

    fn step_sequence(&mut self, now: Instant) -> Instant {
        let Self {
            state,
            sequencer,
            matcher,
            capture,
            input,
            events,
            ..
        } = self;
        let EngineState::Sequencing(run) = state else {
            return now + sequencer.tick_interval();
        };
        let mut io = Io {
            capture: capture.as_mut(),
            input: input.as_mut(),
            matcher,
            events,
        };

        match sequencer.step(run, &mut io, now) {
            Ok(Step::Stay | Step::Advanced) => now + sequencer.tick_interval(),
            Ok(Step::Finished) => self.finish_sequence(SequenceOutcome::Completed, now),
            Err(e) => {
                warn!(error = %e, "sequence aborted");
                self.report(ErrorKind::Sequence, e.to_string());
                self.finish_sequence(SequenceOutcome::Aborted, now)
            }
        }
    }

    /// Ends the active run and resumes trigger polling.
    fn finish_sequence(&mut self, outcome: SequenceOutcome, now: Instant) -> Instant {
        if let Some(EngineState::Sequencing(run)) = self.set_state(EngineState::Polling) {
            let duration = now.saturating_duration_since(run.started_at());
            let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            info!(run_id = %run.run_id(), outcome = outcome.as_str(), duration_ms, "sequence finished, polling resumed");
            metrics::record_sequence(outcome, duration);
            self.events.emit(Event::SequenceCompleted {
                timestamp: Utc::now(),
                run_id: run.run_id(),
                outcome,
                duration_ms,
            });
        }
        self.watcher.rearm();
        now + self.watcher.interval()
    }
}

impl Scheduled for ClickerEngine {
    fn name(&self) -> &str {
        CLICKER
    }

    fn start(&mut self, now: Instant) -> Option<Instant> {
        if self.state.is_running() {
            debug!("clicker already running");
            return None;
        }
        self.set_state(EngineState::Polling)?;
        self.watcher.rearm();
        info!(region = %self.watcher.region(), "clicker started");
        self.events.emit(Event::EngineStarted {
            timestamp: Utc::now(),
            engine: CLICKER.to_string(),
        });
        Some(now)
    }

    fn stop(&mut self) {
        if !self.state.is_running() {
            return;
        }
        if let Some(EngineState::Sequencing(run)) = self.set_state(EngineState::Idle) {
            info!(run_id = %run.run_id(), phase_index = run.phase_index(), "sequence discarded");
        }
        self.watcher.rearm();
        info!("clicker stopped");
        self.events.emit(Event::EngineStopped {
            timestamp: Utc::now(),
            engine: CLICKER.to_string(),
        });
    }

    fn tick(&mut self, now: Instant) -> Option<Instant> {
        match self.state {
            EngineState::Idle => None,
            EngineState::Polling => Some(self.poll_trigger(now)),
            EngineState::Sequencing(_) => Some(self.step_sequence(now)),
        }
    }
}
