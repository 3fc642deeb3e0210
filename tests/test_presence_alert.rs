//! Presence detector runs: edge notifications and repeat escalation.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{Fixture, background, glyph, paste, red_block, wait_for};
use image::RgbaImage;
use pixeljack::alert::PresenceDetector;
use pixeljack::config::{AlertConfig, ConfigLoader};
use pixeljack::notify::{CollectingSink, NotificationSink};
use pixeljack::observability::{Event, EventBus};
use pixeljack::platform::stub::{RecordingInput, StubBackend, VirtualScreen};
use pixeljack::runtime::build_detector;
use pixeljack::scheduler::TaskHandle;
use tokio_util::sync::CancellationToken;

struct Rig {
    screen: VirtualScreen,
    sink: Arc<CollectingSink>,
    rx: tokio::sync::broadcast::Receiver<Event>,
    handle: TaskHandle<PresenceDetector>,
}

impl Rig {
    fn start(config: &AlertConfig, initial: RgbaImage) -> Self {
        let screen = VirtualScreen::from_image(initial);
        let backend = StubBackend::new(screen.clone(), RecordingInput::new());
        let sink = Arc::new(CollectingSink::default());
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        let detector = build_detector(
            config,
            &backend,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            &events,
        )
        .unwrap();
        let handle = TaskHandle::spawn(detector, &CancellationToken::new());
        assert!(handle.start());
        Self {
            screen,
            sink,
            rx,
            handle,
        }
    }
}

fn load_alert(dir: &Path, yaml: &str) -> AlertConfig {
    let raw = format!("alert:\n{yaml}");
    let loaded = ConfigLoader::with_defaults()
        .load_str(&raw, &dir.join("alert.yaml"), dir)
        .unwrap();
    loaded.config.alert.clone().unwrap()
}

fn quiet_screen() -> RgbaImage {
    background(200, 150)
}

fn marked_screen() -> RgbaImage {
    let mut img = quiet_screen();
    red_block(&mut img, 60, 40, 4, 4);
    img
}

const ESCALATING: &str = r"
  nickname: rival
  region: { x1: 0, y1: 0, x2: 200, y2: 150 }
  poll_interval_ms: 500
  probe:
    kind: red_pixels
    threshold: 5
  repeat:
    max_count: 10
    interval_ms: 6000
";

#[tokio::test(start_paused = true)]
async fn repeat_alerts_stop_at_the_limit_and_rearm_on_the_next_edge() {
    let fx = Fixture::new();
    let config = load_alert(fx.path(), ESCALATING);
    let mut rig = Rig::start(&config, marked_screen());

    wait_for(&mut rig.rx, |e| matches!(e, Event::UserDetected { .. })).await;
    // well past 10 x 6s while the marker stays on screen
    tokio::time::sleep(Duration::from_secs(120)).await;

    let texts = rig.sink.texts();
    let expected: Vec<String> = (1..=10)
        .map(|n| format!("🚨 rival detected ({n}/10)"))
        .collect();
    assert_eq!(texts, expected);

    rig.screen.set(quiet_screen());
    wait_for(&mut rig.rx, |e| matches!(e, Event::UserDisappeared { .. })).await;
    assert_eq!(rig.sink.texts().last().unwrap(), "✅ rival gone");

    rig.screen.set(marked_screen());
    wait_for(&mut rig.rx, |e| matches!(e, Event::UserDetected { .. })).await;
    assert_eq!(rig.sink.texts().last().unwrap(), "🚨 rival detected (1/10)");
    assert_eq!(rig.sink.texts().len(), 12);

    assert!(rig.handle.shutdown().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn marker_below_threshold_is_absent() {
    let fx = Fixture::new();
    let config = load_alert(
        fx.path(),
        r"
  region: { x1: 0, y1: 0, x2: 200, y2: 150 }
  probe:
    kind: red_pixels
    threshold: 50
",
    );
    let rig = Rig::start(&config, marked_screen());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(rig.sink.texts().is_empty());
    assert!(rig.screen.grabs() >= 10);

    let detector = rig.handle.shutdown().await.unwrap();
    assert!(!detector.is_present());
}

#[tokio::test(start_paused = true)]
async fn single_alert_without_repeat_policy() {
    let fx = Fixture::new();
    let config = load_alert(
        fx.path(),
        r"
  name: lobby
  region: { x1: 0, y1: 0, x2: 200, y2: 150 }
  probe:
    kind: red_pixels
    threshold: 1
",
    );
    let mut rig = Rig::start(&config, marked_screen());

    let detected = wait_for(&mut rig.rx, |e| matches!(e, Event::UserDetected { .. })).await;
    let Event::UserDetected {
        detector, count, ..
    } = detected
    else {
        unreachable!()
    };
    assert_eq!(detector, "lobby");
    assert_eq!(count, 16);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(rig.sink.texts(), vec!["user detected".to_string()]);

    rig.screen.set(quiet_screen());
    wait_for(&mut rig.rx, |e| matches!(e, Event::UserDisappeared { .. })).await;
    assert_eq!(
        rig.sink.texts(),
        vec!["user detected".to_string(), "✅ user gone".to_string()]
    );

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn template_probe_detects_a_glyph_with_snapshot() {
    let fx = Fixture::new();
    fx.write_png("badge.png", &glyph(7, 20, 12));
    let config = load_alert(
        fx.path(),
        r"
  region: { x1: 0, y1: 0, x2: 200, y2: 150 }
  snapshot: true
  probe:
    kind: template
    templates: [badge.png]
",
    );
    let mut rig = Rig::start(&config, quiet_screen());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rig.sink.notifications().is_empty());

    rig.screen.update(|img| paste(img, &glyph(7, 20, 12), 90, 70));
    wait_for(&mut rig.rx, |e| matches!(e, Event::UserDetected { .. })).await;

    let sent = rig.sink.notifications();
    assert_eq!(sent.len(), 1);
    let png = sent[0].image.as_ref().expect("snapshot attached");
    assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

    rig.handle.shutdown().await;
}
