//! Presence detector.
//!
//! Samples a region on a fixed interval and decides whether a marker is
//! present, either by counting red pixels or by matching templates. The
//! `Absent -> Present` and `Present -> Absent` edges each produce one
//! notification; while present, an optional escalation re-sends a
//! counted alert on its own interval until the configured maximum.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::notify::{Notification, NotificationSink};
use crate::observability::{ErrorKind, Event, EventBus, metrics};
use crate::platform::{Frame, ScreenCapture};
use crate::scheduler::Scheduled;
use crate::vision::{ColorBand, Region, TemplateAsset, TemplateMatcher};

/// Default number of escalation alerts per detection.
pub const DEFAULT_MAX_REPEATS: u32 = 10;

/// Default time between escalation alerts.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(6);

/// How presence is measured.
#[derive(Debug)]
pub enum Probe {
    /// Count pixels inside `band`; present when the count reaches `threshold`.
    RedPixels {
        /// Colour band.
        band: ColorBand,
        /// Minimum matching pixels.
        threshold: u32,
    },
    /// Present when any template matches.
    Template {
        /// Templates, tried in order.
        templates: Vec<Arc<TemplateAsset>>,
        /// Matcher with its own threshold.
        matcher: TemplateMatcher,
    },
}

impl Probe {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RedPixels { .. } => "red_pixels",
            Self::Template { .. } => "template",
        }
    }

    /// Raw measurement: matching pixels, or 1/0 for a template hit.
    fn measure(&self, frame: &Frame) -> u32 {
        match self {
            Self::RedPixels { band, .. } => band.count(frame.rgba()),
            Self::Template { templates, matcher } => {
                u32::from(matcher.locate_any(templates, frame).is_some())
            }
        }
    }

    const fn is_present(&self, measure: u32) -> bool {
        match self {
            Self::RedPixels { threshold, .. } => measure >= *threshold,
            Self::Template { .. } => measure > 0,
        }
    }
}

/// Escalation schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatPolicy {
    /// Alerts per detection, including the one sent on the edge.
    pub max_count: u32,
    /// Time between alerts.
    pub interval: Duration,
}

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_REPEATS,
            interval: DEFAULT_REPEAT_INTERVAL,
        }
    }
}

/// Static detector settings.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Detector name in events and logs.
    pub name: String,
    /// Name used in notification texts.
    pub nickname: String,
    /// Sampled region.
    pub region: Region,
    /// Time between samples.
    pub poll_interval: Duration,
    /// Escalation; `None` sends a single alert per detection.
    pub repeat: Option<RepeatPolicy>,
    /// Attach a PNG of the region to the detection alert.
    pub snapshot: bool,
}

#[derive(Debug, Clone, Copy)]
struct Escalation {
    sent: u32,
    next_at: Instant,
}

/// Edge-triggered presence alerts for one region.
pub struct PresenceDetector {
    settings: DetectorSettings,
    probe: Probe,
    capture: Box<dyn ScreenCapture>,
    sink: Arc<dyn NotificationSink>,
    events: Arc<EventBus>,
    running: bool,
    present: bool,
    last_count: Option<u32>,
    escalation: Option<Escalation>,
    next_poll: Option<Instant>,
}

impl std::fmt::Debug for PresenceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceDetector")
            .field("name", &self.settings.name)
            .field("probe", &self.probe.kind())
            .field("running", &self.running)
            .field("present", &self.present)
            .finish_non_exhaustive()
    }
}

impl PresenceDetector {
    /// Creates a stopped detector.
    #[must_use]
    pub fn new(
        settings: DetectorSettings,
        probe: Probe,
        capture: Box<dyn ScreenCapture>,
        sink: Arc<dyn NotificationSink>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            probe,
            capture,
            sink,
            events,
            running: false,
            present: false,
            last_count: None,
            escalation: None,
            next_poll: None,
        }
    }

    /// `true` while the marker is considered present.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.present
    }

    fn poll(&mut self, now: Instant) {
        metrics::record_poll("alert");
        let started = std::time::Instant::now();
        let frame = match self.capture.grab(&self.settings.region) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(detector = %self.settings.name, error = %e, "capture failed, retrying next poll");
                metrics::record_error(ErrorKind::Capture);
                self.events.emit(Event::error(ErrorKind::Capture, e.to_string()));
                return;
            }
        };
        let count = self.probe.measure(&frame);
        metrics::record_capture_duration("alert", started.elapsed());

        if self.last_count != Some(count) {
            trace!(detector = %self.settings.name, count, "measurement changed");
        }
        self.last_count = Some(count);

        // edges compare against the logical state, never the raw count
        let present = self.probe.is_present(count);
        match (self.present, present) {
            (false, true) => self.on_detected(&frame, count, now),
            (true, false) => self.on_cleared(),
            _ => {}
        }
    }

    fn on_detected(&mut self, frame: &Frame, count: u32, now: Instant) {
        self.present = true;
        let message = match self.settings.repeat {
            Some(policy) => {
                self.escalation = (policy.max_count > 1).then_some(Escalation {
                    sent: 1,
                    next_at: now + policy.interval,
                });
                self.repeat_text(1, policy.max_count)
            }
            None => format!("{} detected", self.settings.nickname),
        };
        info!(detector = %self.settings.name, count, "marker detected");
        metrics::record_alert("detected");

        let mut notification = Notification::text(message.clone());
        if self.settings.snapshot {
            match frame.to_png() {
                Ok(png) => notification = notification.with_image(png),
                Err(e) => warn!(detector = %self.settings.name, error = %e, "snapshot encoding failed, sending text only"),
            }
        }
        self.sink.send(notification);

        self.events.emit(Event::UserDetected {
            timestamp: Utc::now(),
            detector: self.settings.name.clone(),
            message,
            count,
        });
        if let Some(policy) = self.settings.repeat {
            self.events.emit(Event::AlertRepeated {
                timestamp: Utc::now(),
                detector: self.settings.name.clone(),
                repeat: 1,
                max: policy.max_count,
            });
        }
    }

    fn on_cleared(&mut self) {
        self.present = false;
        self.escalation = None;
        let message = format!("✅ {} gone", self.settings.nickname);
        info!(detector = %self.settings.name, "marker gone");
        metrics::record_alert("cleared");
        self.sink.send(Notification::text(message.clone()));
        self.events.emit(Event::UserDisappeared {
            timestamp: Utc::now(),
            detector: self.settings.name.clone(),
            message,
        });
    }

    fn escalate(&mut self, now: Instant) {
        let (Some(mut esc), Some(policy)) = (self.escalation, self.settings.repeat) else {
            return;
        };
        esc.sent += 1;
        debug!(detector = %self.settings.name, repeat = esc.sent, max = policy.max_count, "repeat alert");
        metrics::record_alert("repeat");
        self.sink
            .send(Notification::text(self.repeat_text(esc.sent, policy.max_count)));
        self.events.emit(Event::AlertRepeated {
            timestamp: Utc::now(),
            detector: self.settings.name.clone(),
            repeat: esc.sent,
            max: policy.max_count,
        });

        self.escalation = if esc.sent >= policy.max_count {
            info!(detector = %self.settings.name, "repeat limit reached");
            None
        } else {
            // a stalled tick sends one repeat, not the missed backlog
            esc.next_at = now + policy.interval;
            Some(esc)
        };
    }

    fn repeat_text(&self, n: u32, max: u32) -> String {
        format!("🚨 {} detected ({n}/{max})", self.settings.nickname)
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.next_poll, self.escalation) {
            (Some(poll), Some(esc)) => Some(poll.min(esc.next_at)),
            (poll, esc) => poll.or(esc.map(|e| e.next_at)),
        }
    }
}

impl Scheduled for PresenceDetector {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn start(&mut self, now: Instant) -> Option<Instant> {
        if self.running {
            debug!(detector = %self.settings.name, "detector already running");
            return None;
        }
        self.running = true;
        self.present = false;
        self.last_count = None;
        self.escalation = None;
        self.next_poll = Some(now);
        info!(
            detector = %self.settings.name,
            probe = self.probe.kind(),
            region = %self.settings.region,
            "detector started"
        );
        self.events.emit(Event::EngineStarted {
            timestamp: Utc::now(),
            engine: self.settings.name.clone(),
        });
        Some(now)
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.escalation = None;
        self.next_poll = None;
        self.last_count = None;
        info!(detector = %self.settings.name, "detector stopped");
        self.events.emit(Event::EngineStopped {
            timestamp: Utc::now(),
            engine: self.settings.name.clone(),
        });
    }

    fn tick(&mut self, now: Instant) -> Option<Instant> {
        if !self.running {
            return None;
        }
        if self.escalation.is_some_and(|e| now >= e.next_at) {
            self.escalate(now);
        }
        if self.next_poll.is_some_and(|t| now >= t) {
            self.poll(now);
            self.next_poll = Some(now + self.settings.poll_interval);
        }
        self.next_deadline()
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::notify::CollectingSink;
    use crate::platform::stub::VirtualScreen;

    const GREY: Rgba<u8> = Rgba([90, 90, 90, 255]);

    fn detector(
        screen: &VirtualScreen,
        repeat: Option<RepeatPolicy>,
    ) -> (PresenceDetector, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let det = PresenceDetector::new(
            DetectorSettings {
                name: "watch".to_string(),
                nickname: "Scout".to_string(),
                region: Region::new(0, 0, 20, 20).unwrap(),
                poll_interval: Duration::from_millis(500),
                repeat,
                snapshot: false,
            },
            Probe::RedPixels {
                band: ColorBand::RED,
                threshold: 3,
            },
            Box::new(screen.clone()),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            Arc::new(EventBus::new()),
        );
        (det, sink)
    }

    fn paint_red(screen: &VirtualScreen, pixels: u32) {
        screen.update(|img| {
            for x in 0..pixels {
                img.put_pixel(x, 0, Rgba([230, 20, 10, 255]));
            }
        });
    }

    /// Runs the detector's own deadlines until `until`.
    fn run_until(det: &mut PresenceDetector, mut now: Instant, until: Instant) -> Instant {
        while now <= until {
            match det.tick(now) {
                Some(next) => now = next,
                None => break,
            }
        }
        now
    }

    #[test]
    fn edges_notify_once_each() {
        let screen = VirtualScreen::solid(40, 40, GREY);
        let (mut det, sink) = detector(&screen, None);
        let t0 = Instant::now();
        det.start(t0);
        let t = run_until(&mut det, t0, t0 + Duration::from_secs(2));
        assert!(sink.texts().is_empty());

        paint_red(&screen, 2);
        let t = run_until(&mut det, t, t + Duration::from_secs(2));
        assert!(sink.texts().is_empty(), "below threshold");

        paint_red(&screen, 5);
        let t = run_until(&mut det, t, t + Duration::from_secs(5));
        assert_eq!(sink.texts(), vec!["Scout detected"]);
        assert!(det.is_present());

        screen.set(image::RgbaImage::from_pixel(40, 40, GREY));
        run_until(&mut det, t, t + Duration::from_secs(5));
        assert_eq!(sink.texts(), vec!["Scout detected", "✅ Scout gone"]);
    }

    #[test]
    fn escalation_is_bounded_per_edge() {
        let screen = VirtualScreen::solid(40, 40, GREY);
        paint_red(&screen, 10);
        let policy = RepeatPolicy {
            max_count: 4,
            interval: Duration::from_secs(6),
        };
        let (mut det, sink) = detector(&screen, Some(policy));
        let t0 = Instant::now();
        det.start(t0);
        let t = run_until(&mut det, t0, t0 + Duration::from_secs(120));

        let texts = sink.texts();
        assert_eq!(texts.len(), 4);
        assert_eq!(texts[0], "🚨 Scout detected (1/4)");
        assert_eq!(texts[3], "🚨 Scout detected (4/4)");

        // a fresh edge re-arms escalation
        screen.set(image::RgbaImage::from_pixel(40, 40, GREY));
        let t = run_until(&mut det, t, t + Duration::from_secs(1));
        paint_red(&screen, 10);
        run_until(&mut det, t, t + Duration::from_secs(1));
        let texts = sink.texts();
        assert_eq!(texts[4], "✅ Scout gone");
        assert_eq!(texts[5], "🚨 Scout detected (1/4)");
    }

    #[test]
    fn stalled_tick_sends_one_repeat() {
        let screen = VirtualScreen::solid(40, 40, GREY);
        paint_red(&screen, 10);
        let policy = RepeatPolicy {
            max_count: 10,
            interval: Duration::from_secs(6),
        };
        let (mut det, sink) = detector(&screen, Some(policy));
        let t0 = Instant::now();
        det.start(t0);
        det.tick(t0);
        assert_eq!(sink.texts(), vec!["🚨 Scout detected (1/10)"]);

        // ten intervals late
        let late = t0 + Duration::from_secs(60);
        det.tick(late);
        assert_eq!(sink.texts().len(), 2);
        assert_eq!(sink.texts()[1], "🚨 Scout detected (2/10)");

        let t = run_until(&mut det, late, late + Duration::from_secs(5));
        assert_eq!(sink.texts().len(), 2);
        run_until(&mut det, t, late + Duration::from_secs(6));
        assert_eq!(sink.texts().len(), 3);
        assert_eq!(sink.texts()[2], "🚨 Scout detected (3/10)");
    }

    #[test]
    fn clearing_stops_escalation() {
        let screen = VirtualScreen::solid(40, 40, GREY);
        paint_red(&screen, 10);
        let (mut det, sink) = detector(&screen, Some(RepeatPolicy::default()));
        let t0 = Instant::now();
        det.start(t0);
        let t = run_until(&mut det, t0, t0 + Duration::from_secs(7));
        assert_eq!(sink.texts().len(), 2);

        screen.set(image::RgbaImage::from_pixel(40, 40, GREY));
        run_until(&mut det, t, t + Duration::from_secs(60));
        let texts = sink.texts();
        assert_eq!(texts.len(), 3);
        assert_eq!(texts[2], "✅ Scout gone");
    }

    #[test]
    fn stop_resets_presence_and_restart_realerts() {
        let screen = VirtualScreen::solid(40, 40, GREY);
        paint_red(&screen, 10);
        let (mut det, sink) = detector(&screen, None);
        let t0 = Instant::now();
        det.start(t0);
        det.tick(t0);
        det.stop();
        det.stop();
        assert_eq!(det.tick(t0 + Duration::from_secs(1)), None);
        assert!(det.start(t0).is_some());
        assert!(det.start(t0).is_none());
        det.tick(t0);
        assert_eq!(sink.texts().len(), 2);
    }

    #[test]
    fn capture_failure_does_not_flip_state() {
        let screen = VirtualScreen::solid(40, 40, GREY);
        paint_red(&screen, 10);
        let (mut det, sink) = detector(&screen, None);
        let t0 = Instant::now();
        det.start(t0);
        det.tick(t0);
        screen.fail_next(3);
        run_until(&mut det, t0, t0 + Duration::from_secs(3));
        assert_eq!(sink.texts(), vec!["Scout detected"]);
    }
}
