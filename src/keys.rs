//! Timed key presser.
//!
//! Each cycle taps one key `count` times, 50 ms apart, then waits a
//! uniformly random time between the configured bounds. The first cycle
//! starts as soon as the presser is started.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::observability::{ErrorKind, Event, EventBus, metrics};
use crate::platform::{InputInjector, Key};
use crate::scheduler::Scheduled;

/// Gap between presses inside one cycle.
pub const PRESS_GAP: Duration = Duration::from_millis(50);

/// Shortest allowed wait between cycles, in seconds.
pub const MIN_INTERVAL_SECS: f64 = 0.1;

/// Longest allowed wait between cycles, in seconds.
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// Most presses per cycle.
pub const MAX_PRESS_COUNT: u32 = 100;

/// Normalized key schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeySchedule {
    key: Key,
    min_secs: f64,
    max_secs: f64,
    count: u32,
}

impl KeySchedule {
    /// Builds a schedule, clamping out-of-range values: the minimum is at
    /// least [`MIN_INTERVAL_SECS`], the maximum is at least the minimum,
    /// and `count` is within `1..=MAX_PRESS_COUNT`.
    #[must_use]
    pub fn new(key: Key, min_secs: f64, max_secs: f64, count: u32) -> Self {
        let min_secs = min_secs.max(MIN_INTERVAL_SECS).min(MAX_INTERVAL_SECS);
        let max_secs = max_secs.max(min_secs).min(MAX_INTERVAL_SECS);
        Self {
            key,
            min_secs,
            max_secs,
            count: count.clamp(1, MAX_PRESS_COUNT),
        }
    }

    /// Key to tap.
    #[must_use]
    pub const fn key(&self) -> Key {
        self.key
    }

    /// Interval bounds in seconds.
    #[must_use]
    pub const fn interval_secs(&self) -> (f64, f64) {
        (self.min_secs, self.max_secs)
    }

    /// Presses per cycle.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }
}

/// Drives one [`KeySchedule`].
pub struct KeyPresser {
    name: String,
    schedule: KeySchedule,
    input: Box<dyn InputInjector>,
    events: Arc<EventBus>,
    rng: StdRng,
    running: bool,
    pressed_in_cycle: u32,
    last_error: Option<String>,
}

impl std::fmt::Debug for KeyPresser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPresser")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl KeyPresser {
    /// Creates a stopped presser with an OS-seeded RNG.
    #[must_use]
    pub fn new(schedule: KeySchedule, input: Box<dyn InputInjector>, events: Arc<EventBus>) -> Self {
        Self::with_rng(schedule, input, events, StdRng::from_os_rng())
    }

    /// Creates a stopped presser with the given RNG.
    #[must_use]
    pub fn with_rng(
        schedule: KeySchedule,
        input: Box<dyn InputInjector>,
        events: Arc<EventBus>,
        rng: StdRng,
    ) -> Self {
        Self {
            name: format!("keys:{}", schedule.key()),
            schedule,
            input,
            events,
            rng,
            running: false,
            pressed_in_cycle: 0,
            last_error: None,
        }
    }

    fn next_cycle_delay(&mut self) -> Duration {
        let (min, max) = self.schedule.interval_secs();
        let secs = self.rng.random_range(min..=max);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs_f64(MIN_INTERVAL_SECS))
    }

    fn fail(&mut self, message: String) {
        if self.last_error.as_deref() != Some(message.as_str()) {
            warn!(presser = %self.name, error = %message, "key injection failed, presser stopped");
            metrics::record_error(ErrorKind::Input);
            self.events.emit(Event::error(ErrorKind::Input, message.clone()));
            self.last_error = Some(message);
        }
        self.stop();
    }
}

impl Scheduled for KeyPresser {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, now: Instant) -> Option<Instant> {
        if self.running {
            debug!(presser = %self.name, "presser already running");
            return None;
        }
        self.running = true;
        self.pressed_in_cycle = 0;
        let (min, max) = self.schedule.interval_secs();
        info!(presser = %self.name, min, max, count = self.schedule.count(), "key presser started");
        self.events.emit(Event::EngineStarted {
            timestamp: Utc::now(),
            engine: self.name.clone(),
        });
        Some(now)
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.pressed_in_cycle = 0;
        info!(presser = %self.name, "key presser stopped");
        self.events.emit(Event::EngineStopped {
            timestamp: Utc::now(),
            engine: self.name.clone(),
        });
    }

    fn tick(&mut self, now: Instant) -> Option<Instant> {
        if !self.running {
            return None;
        }
        let key = self.schedule.key();
        if let Err(e) = self.input.tap_key(key) {
            self.fail(e.to_string());
            return None;
        }
        self.pressed_in_cycle += 1;

        if self.pressed_in_cycle < self.schedule.count() {
            return Some(now + PRESS_GAP);
        }

        let presses = std::mem::take(&mut self.pressed_in_cycle);
        metrics::record_key_presses(presses);
        self.events.emit(Event::KeyPressed {
            timestamp: Utc::now(),
            key,
            presses,
        });
        let delay = self.next_cycle_delay();
        debug!(presser = %self.name, presses, ?delay, "cycle done");
        Some(now + delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::RecordingInput;

    fn presser(schedule: KeySchedule, input: &RecordingInput) -> KeyPresser {
        KeyPresser::with_rng(
            schedule,
            Box::new(input.clone()),
            Arc::new(EventBus::new()),
            StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn schedule_is_normalized() {
        let s = KeySchedule::new(Key::Space, 0.0, -3.0, 0);
        assert_eq!(s.interval_secs(), (MIN_INTERVAL_SECS, MIN_INTERVAL_SECS));
        assert_eq!(s.count(), 1);

        let s = KeySchedule::new(Key::Enter, 5.0, 2.0, 500);
        assert_eq!(s.interval_secs(), (5.0, 5.0));
        assert_eq!(s.count(), MAX_PRESS_COUNT);

        let s = KeySchedule::new(Key::Tab, f64::NAN, f64::INFINITY, 3);
        assert_eq!(s.interval_secs(), (MIN_INTERVAL_SECS, MAX_INTERVAL_SECS));
    }

    #[test]
    fn cycle_presses_then_waits_within_bounds() {
        let input = RecordingInput::new();
        let mut p = presser(KeySchedule::new(Key::Char('f'), 5.0, 10.0, 3), &input);
        let t0 = Instant::now();
        assert_eq!(p.start(t0), Some(t0));

        let t1 = p.tick(t0).unwrap();
        assert_eq!(t1, t0 + PRESS_GAP);
        let t2 = p.tick(t1).unwrap();
        assert_eq!(t2, t1 + PRESS_GAP);
        let next = p.tick(t2).unwrap();
        let wait = next - t2;
        assert!(wait >= Duration::from_secs(5) && wait <= Duration::from_secs(10), "{wait:?}");
        assert_eq!(input.keys(), vec![Key::Char('f'); 3]);
    }

    #[test]
    fn injection_failure_stops_presser() {
        let input = RecordingInput::new();
        input.fail_next(1);
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let mut p = KeyPresser::with_rng(
            KeySchedule::new(Key::Space, 1.0, 1.0, 1),
            Box::new(input.clone()),
            Arc::clone(&events),
            StdRng::seed_from_u64(1),
        );
        let t0 = Instant::now();
        p.start(t0);
        assert_eq!(p.tick(t0), None);
        assert_eq!(p.tick(t0), None);

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["EngineStarted", "ErrorOccurred", "EngineStopped"]);

        // restart works once input recovers
        assert!(p.start(t0).is_some());
        assert!(p.tick(t0).is_some());
        assert_eq!(input.keys(), vec![Key::Space]);
    }
}
