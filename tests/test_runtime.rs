//! Runtime assembly: engine selection, start/stop and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Fixture, collect_until};
use pixeljack::config::{ConfigLoader, PixelJackConfig};
use pixeljack::error::{ExitCode, PixelJackError};
use pixeljack::observability::{Event, EventBus};
use pixeljack::platform::Key;
use pixeljack::platform::stub::StubBackend;
use pixeljack::runtime::{EngineKind, Runtime};

const ALL_ENGINES: &str = r"
clicker:
  trigger:
    region: { x1: 0, y1: 0, x2: 100, y2: 100 }
    templates: [never-written.png]
  sequence:
    phases:
      - kind: fixed_wait
        duration_secs: 1
alert:
  region: { x1: 0, y1: 0, x2: 100, y2: 100 }
keys:
  - key: space
    min_interval_secs: 1
    max_interval_secs: 1
    press_count: 2
  - key: enter
    min_interval_secs: 2
    max_interval_secs: 2
";

fn load(fx: &Fixture, yaml: &str) -> PixelJackConfig {
    let path = fx.write("bot.yaml", yaml);
    let loaded = ConfigLoader::with_defaults().load(&path).unwrap();
    (*loaded.config).clone()
}

fn count(keys: &[Key], key: Key) -> usize {
    keys.iter().filter(|k| **k == key).count()
}

#[tokio::test(start_paused = true)]
async fn only_selects_engines_by_family() {
    let fx = Fixture::new();
    let config = load(&fx, ALL_ENGINES);
    let backend = StubBackend::dry_run(320, 240);
    let events = Arc::new(EventBus::new());

    let runtime = Runtime::launch(&config, &backend, &events, &[EngineKind::Keys]).unwrap();
    assert_eq!(runtime.engine_names(), vec!["keys:space", "keys:enter"]);
    assert!(runtime.shutdown(Duration::from_secs(1)).await);

    let runtime = Runtime::launch(&config, &backend, &events, &[]).unwrap();
    assert_eq!(
        runtime.engine_names(),
        vec!["clicker", "alert", "keys:space", "keys:enter"]
    );
    assert!(runtime.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn launching_nothing_is_a_config_error() {
    let fx = Fixture::new();
    let config = load(
        &fx,
        "keys:\n  - key: space\n    min_interval_secs: 1\n    max_interval_secs: 2\n",
    );
    let backend = StubBackend::dry_run(320, 240);
    let events = Arc::new(EventBus::new());

    let err = Runtime::launch(&config, &backend, &events, &[EngineKind::Clicker]).unwrap_err();
    assert!(matches!(err, PixelJackError::Config(_)));
    assert_eq!(err.exit_code(), ExitCode::CONFIG_ERROR);
}

#[tokio::test(start_paused = true)]
async fn key_pressers_run_on_their_own_schedules() {
    let fx = Fixture::new();
    let config = load(&fx, ALL_ENGINES);
    let backend = StubBackend::dry_run(320, 240);
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();

    let runtime = Runtime::launch(&config, &backend, &events, &[EngineKind::Keys]).unwrap();
    tokio::time::sleep(Duration::from_millis(10_200)).await;

    let keys = backend.recorder().keys();
    let spaces = count(&keys, Key::Space);
    let enters = count(&keys, Key::Enter);
    assert!(spaces >= 16, "space pressed {spaces} times");
    assert_eq!(spaces % 2, 0, "space cycles press twice");
    assert!((5..=6).contains(&enters), "enter pressed {enters} times");

    let cycles = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            Event::KeyPressed { key, presses, .. } => Some((key, presses)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(cycles.iter().any(|c| *c == (Key::Space, 2)));
    assert!(cycles.iter().any(|c| *c == (Key::Enter, 1)));

    runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn stop_all_pauses_and_start_all_resumes() {
    let fx = Fixture::new();
    let config = load(&fx, ALL_ENGINES);
    let backend = StubBackend::dry_run(320, 240);
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();

    let runtime = Runtime::launch(&config, &backend, &events, &[EngineKind::Keys]).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    runtime.stop_all();
    // stopping twice leaves the same state
    runtime.stop_all();
    let mut stops = 0;
    collect_until(&mut rx, |e| {
        if matches!(e, Event::EngineStopped { .. }) {
            stops += 1;
        }
        stops == 2
    })
    .await;
    let paused_at = backend.recorder().keys().len();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(backend.recorder().keys().len(), paused_at);

    runtime.start_all();
    runtime.start_all();
    tokio::time::sleep(Duration::from_millis(10)).await;
    // each presser taps immediately on start, once
    let resumed = backend.recorder().keys();
    assert_eq!(count(&resumed[paused_at..], Key::Space), 1);
    assert_eq!(count(&resumed[paused_at..], Key::Enter), 1);

    assert!(runtime.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_engine() {
    let fx = Fixture::new();
    let config = load(&fx, ALL_ENGINES);
    let backend = StubBackend::dry_run(320, 240);
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();

    let runtime = Runtime::launch(&config, &backend, &events, &[]).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(runtime.shutdown(Duration::from_secs(1)).await);

    let mut stopped: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            Event::EngineStopped { engine, .. } => Some(engine),
            _ => None,
        })
        .collect();
    stopped.sort();
    assert_eq!(stopped, vec!["alert", "clicker", "keys:enter", "keys:space"]);
}
