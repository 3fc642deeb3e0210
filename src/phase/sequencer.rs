//! Phase sequencer.
//!
//! Walks an ordered list of [`Phase`]s, one tick at a time. Each tick
//! evaluates only the current phase and either stays on it or advances
//! by exactly one; nothing is ever skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::schema::TimeoutBehavior;
use crate::error::SequenceError;
use crate::observability::{ErrorKind, Event, EventBus, metrics};
use crate::platform::{ClickType, Frame, InputInjector, ScreenCapture};
use crate::vision::{MatchResult, Region, TemplateAsset, TemplateMatcher};

use super::state::SequenceRun;

/// Interval between fixed-wait progress log lines.
const PROGRESS_LOG_INTERVAL_SECS: u64 = 30;

/// What a phase does on each tick.
#[derive(Debug, Clone)]
pub enum PhaseAction {
    /// While `target` is visible, click `actor` and stay. Advance once
    /// `target` is gone.
    ActUntilAbsent {
        /// Template that must disappear.
        target: Arc<TemplateAsset>,
        /// Template clicked while waiting.
        actor: Arc<TemplateAsset>,
        /// Click used on `actor`.
        click: ClickType,
    },
    /// Advance once `target` is visible; until then click `actor`.
    ActUntilPresent {
        /// Template that must appear.
        target: Arc<TemplateAsset>,
        /// Template clicked while waiting.
        actor: Arc<TemplateAsset>,
        /// Click used on `actor`.
        click: ClickType,
    },
    /// Let `wait_ticks` ticks pass, then click `target` if it is visible
    /// and advance either way.
    WaitThenAct {
        /// Optional click target.
        target: Arc<TemplateAsset>,
        /// Ticks to let pass after arming.
        wait_ticks: u32,
        /// Click used on `target`.
        click: ClickType,
    },
    /// Wait a fixed wall-clock time, reporting progress every tick.
    FixedWait {
        /// Total wait.
        duration: Duration,
    },
}

impl PhaseAction {
    /// Short kind name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ActUntilAbsent { .. } => "act_until_absent",
            Self::ActUntilPresent { .. } => "act_until_present",
            Self::WaitThenAct { .. } => "wait_then_act",
            Self::FixedWait { .. } => "fixed_wait",
        }
    }
}

/// One step of a sequence.
#[derive(Debug, Clone)]
pub struct Phase {
    /// Display name.
    pub name: String,
    /// Per-tick behaviour.
    pub action: PhaseAction,
    /// Time limit for the matching phase kinds. Fixed waits ignore it.
    pub timeout: Option<Duration>,
    /// What happens when `timeout` runs out.
    pub on_timeout: TimeoutBehavior,
}

/// Outcome of one sequencer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Still on the same phase.
    Stay,
    /// Moved to the next phase.
    Advanced,
    /// The last phase finished.
    Finished,
}

/// Collaborators borrowed for one tick.
pub struct Io<'a> {
    /// Screen source.
    pub capture: &'a mut dyn ScreenCapture,
    /// Mouse and keyboard.
    pub input: &'a mut dyn InputInjector,
    /// Template search.
    pub matcher: &'a TemplateMatcher,
    /// Event sink.
    pub events: &'a EventBus,
}

/// Evaluates phases against the sequence region.
#[derive(Debug, Clone)]
pub struct PhaseSequencer {
    phases: Vec<Phase>,
    region: Region,
    tick_interval: Duration,
}

/// Per-tick decision of a phase before bookkeeping.
enum Decision {
    Stay,
    Advance,
}

impl PhaseSequencer {
    /// Creates a sequencer.
    #[must_use]
    pub const fn new(phases: Vec<Phase>, region: Region, tick_interval: Duration) -> Self {
        Self {
            phases,
            region,
            tick_interval,
        }
    }

    /// Number of phases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// `true` if there are no phases.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Phases in order.
    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Time between ticks.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Region the phases search.
    #[must_use]
    pub const fn region(&self) -> &Region {
        &self.region
    }

    /// Evaluates the current phase of `run` once.
    ///
    /// Capture failures are reported and leave the phase unchanged so the
    /// next tick retries.
    ///
    /// # Errors
    ///
    /// Returns a [`SequenceError`] when a click fails or a phase with
    /// `on_timeout: abort` runs out of time. The caller aborts the run.
    pub fn step(
        &self,
        run: &mut SequenceRun,
        io: &mut Io<'_>,
        now: Instant,
    ) -> Result<Step, SequenceError> {
        let Some(phase) = self.phases.get(run.phase_index()) else {
            return Ok(Step::Finished);
        };
        let entered = run.phase_started(now);

        if let Some(limit) = phase.timeout
            && !matches!(phase.action, PhaseAction::FixedWait { .. })
        {
            let spent = now.saturating_duration_since(entered);
            if spent >= limit {
                match phase.on_timeout {
                    TimeoutBehavior::Abort => {
                        return Err(SequenceError::PhaseTimeout {
                            phase: phase.name.clone(),
                            elapsed: spent,
                        });
                    }
                    TimeoutBehavior::Advance => {
                        warn!(phase = %phase.name, ?spent, "phase timed out, advancing");
                        return Ok(self.advance(run, io.events, phase));
                    }
                }
            }
        }

        let decision = match &phase.action {
            PhaseAction::ActUntilAbsent {
                target,
                actor,
                click,
            } => {
                let Some(frame) = self.grab(io) else {
                    return Ok(Step::Stay);
                };
                if io.matcher.locate(target, &frame).is_none() {
                    Decision::Advance
                } else {
                    self.click_if_visible(io, phase, actor, &frame, *click)?;
                    Decision::Stay
                }
            }
            PhaseAction::ActUntilPresent {
                target,
                actor,
                click,
            } => {
                let Some(frame) = self.grab(io) else {
                    return Ok(Step::Stay);
                };
                if io.matcher.locate(target, &frame).is_some() {
                    Decision::Advance
                } else {
                    self.click_if_visible(io, phase, actor, &frame, *click)?;
                    Decision::Stay
                }
            }
            PhaseAction::WaitThenAct {
                target,
                wait_ticks,
                click,
            } => match run.wait_counter {
                None => {
                    debug!(phase = %phase.name, wait_ticks, "wait armed");
                    run.wait_counter = Some(*wait_ticks);
                    Decision::Stay
                }
                Some(left) if left > 0 => {
                    run.wait_counter = Some(left - 1);
                    Decision::Stay
                }
                Some(_) => {
                    let Some(frame) = self.grab(io) else {
                        return Ok(Step::Stay);
                    };
                    if let Some(m) = io.matcher.locate(target, &frame) {
                        Self::click(io, phase, &m, *click)?;
                    } else {
                        info!(
                            phase = %phase.name,
                            template = target.label(),
                            "optional target not found, proceeding"
                        );
                    }
                    Decision::Advance
                }
            },
            PhaseAction::FixedWait { duration } => {
                let elapsed = now.saturating_duration_since(entered).min(*duration);
                io.events.emit(Event::PhaseProgress {
                    timestamp: Utc::now(),
                    run_id: run.run_id(),
                    phase_index: run.phase_index(),
                    elapsed_secs: elapsed.as_secs_f64(),
                    total_secs: duration.as_secs_f64(),
                });
                let bucket = elapsed.as_secs() / PROGRESS_LOG_INTERVAL_SECS;
                if bucket > run.progress_bucket {
                    run.progress_bucket = bucket;
                    info!(
                        phase = %phase.name,
                        elapsed_secs = elapsed.as_secs(),
                        total_secs = duration.as_secs(),
                        "fixed wait in progress"
                    );
                }
                if elapsed >= *duration {
                    Decision::Advance
                } else {
                    Decision::Stay
                }
            }
        };

        Ok(match decision {
            Decision::Stay => Step::Stay,
            Decision::Advance => self.advance(run, io.events, phase),
        })
    }

    fn grab(&self, io: &mut Io<'_>) -> Option<Frame> {
        let started = std::time::Instant::now();
        let frame = match io.capture.grab(&self.region) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "capture failed, retrying next tick");
                metrics::record_error(ErrorKind::Capture);
                io.events.emit(Event::error(ErrorKind::Capture, e.to_string()));
                return None;
            }
        };
        metrics::record_poll("sequencer");
        metrics::record_capture_duration("sequencer", started.elapsed());
        Some(frame)
    }

    fn click_if_visible(
        &self,
        io: &mut Io<'_>,
        phase: &Phase,
        actor: &TemplateAsset,
        frame: &Frame,
        click: ClickType,
    ) -> Result<(), SequenceError> {
        match io.matcher.locate(actor, frame) {
            Some(m) => Self::click(io, phase, &m, click),
            None => {
                debug!(phase = %phase.name, actor = actor.label(), region = %self.region, "actor not visible, waiting");
                Ok(())
            }
        }
    }

    fn click(
        io: &mut Io<'_>,
        phase: &Phase,
        m: &MatchResult,
        click: ClickType,
    ) -> Result<(), SequenceError> {
        let at = m.center();
        io.input
            .click_at(at, click)
            .map_err(|source| SequenceError::Input {
                phase: phase.name.clone(),
                source,
            })?;
        debug!(phase = %phase.name, template = %m.template, x = at.x, y = at.y, %click, "clicked");
        metrics::record_click(click);
        io.events.emit(Event::ImageClicked {
            timestamp: Utc::now(),
            x: at.x,
            y: at.y,
            click,
        });
        Ok(())
    }

    fn advance(&self, run: &mut SequenceRun, events: &EventBus, phase: &Phase) -> Step {
        let finished = run.phase_index();
        let next = run.advance();
        let description = format!("phase {finished} complete");
        info!(phase = %phase.name, kind = phase.action.kind(), next, "{description}");
        metrics::record_phase_transition(&phase.name);
        events.emit(Event::SequenceStep {
            timestamp: Utc::now(),
            run_id: run.run_id(),
            phase_index: finished,
            phase_name: phase.name.clone(),
            description,
        });
        if next >= self.phases.len() {
            Step::Finished
        } else {
            Step::Advanced
        }
    }
}
