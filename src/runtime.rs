//! Engine assembly and lifecycle.
//!
//! Turns a validated [`PixelJackConfig`] into running engines: one
//! control loop per engine, a notification worker, and the optional
//! event bridge. [`Runtime::shutdown`] stops everything in order and
//! drains pending notifications.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{DetectorSettings, PresenceDetector, Probe, RepeatPolicy};
use crate::config::schema::{
    AlertConfig, ClickerConfig, ForwardConfig, KeyConfig, NotifyConfig, PhaseConfig, PhaseKind,
    PixelJackConfig, ProbeConfig, RetryConfig,
};
use crate::error::{ConfigError, NotifyError, PixelJackError};
use crate::keys::{KeyPresser, KeySchedule};
use crate::notify::{
    BridgeFilter, LogTransport, NotificationSink, NotificationTransport, Notifier, RetryPolicy,
    TelegramTransport, spawn_bridge,
};
use crate::observability::EventBus;
use crate::phase::{ClickerEngine, Phase, PhaseAction, PhaseSequencer, TriggerWatcher};
use crate::platform::Backend;
use crate::scheduler::{Control, TaskHandle};
use crate::vision::{ColorBand, TemplateLibrary, TemplateMatcher};

/// Default time allowed for queued notifications on shutdown.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Engine families that can be selected with `--only`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum EngineKind {
    /// Trigger-then-sequence clicker.
    Clicker,
    /// Presence alert.
    Alert,
    /// Timed key pressers.
    Keys,
}

// ============================================================================
// Builders
// ============================================================================

/// Builds the clicker engine.
///
/// # Errors
///
/// Returns [`PixelJackError::Platform`] if the backend cannot open a
/// capture or input handle.
pub fn build_clicker(
    config: &ClickerConfig,
    backend: &dyn Backend,
    events: &Arc<EventBus>,
) -> Result<ClickerEngine, PixelJackError> {
    let mut library = TemplateLibrary::new(config.matching.invariance);

    let templates = config
        .trigger
        .templates
        .iter()
        .map(|p| library.get(p))
        .collect();
    let watcher = TriggerWatcher::new(
        templates,
        config.trigger.region,
        config.trigger.poll_interval(),
        config.trigger.click,
    );

    let phases = config
        .sequence
        .phases
        .iter()
        .enumerate()
        .map(|(i, phase)| build_phase(i, phase, &mut library))
        .collect();
    let region = config.sequence.region.unwrap_or(config.trigger.region);
    let sequencer = PhaseSequencer::new(phases, region, config.sequence.tick_interval());

    let matcher = TemplateMatcher::with_default_backend(
        config.matching.confidence,
        config.matching.pyramid,
        Arc::clone(events),
    );
    debug!(templates = library.len(), "clicker templates loaded");

    Ok(ClickerEngine::new(
        watcher,
        sequencer,
        matcher,
        backend.capture().map_err(platform)?,
        backend.input().map_err(platform)?,
        Arc::clone(events),
    ))
}

fn build_phase(index: usize, config: &PhaseConfig, library: &mut TemplateLibrary) -> Phase {
    let action = match &config.kind {
        PhaseKind::ActUntilAbsent {
            target,
            actor,
            click,
        } => PhaseAction::ActUntilAbsent {
            target: library.get(target),
            actor: library.get(actor),
            click: *click,
        },
        PhaseKind::ActUntilPresent {
            target,
            actor,
            click,
        } => PhaseAction::ActUntilPresent {
            target: library.get(target),
            actor: library.get(actor),
            click: *click,
        },
        PhaseKind::WaitThenAct {
            target,
            wait_ticks,
            click,
        } => PhaseAction::WaitThenAct {
            target: library.get(target),
            wait_ticks: *wait_ticks,
            click: *click,
        },
        PhaseKind::FixedWait { duration_secs } => PhaseAction::FixedWait {
            duration: Duration::try_from_secs_f64(*duration_secs).unwrap_or_default(),
        },
    };
    Phase {
        name: config
            .name
            .clone()
            .unwrap_or_else(|| format!("phase-{index}")),
        action,
        timeout: config
            .timeout_secs
            .and_then(|t| Duration::try_from_secs_f64(t).ok()),
        on_timeout: config.on_timeout,
    }
}

/// Builds the presence detector.
///
/// # Errors
///
/// Returns [`PixelJackError::Platform`] if the backend cannot open a
/// capture handle.
pub fn build_detector(
    config: &AlertConfig,
    backend: &dyn Backend,
    sink: Arc<dyn NotificationSink>,
    events: &Arc<EventBus>,
) -> Result<PresenceDetector, PixelJackError> {
    let probe = match &config.probe {
        ProbeConfig::RedPixels {
            threshold,
            strict,
            band,
        } => Probe::RedPixels {
            band: band.unwrap_or(if *strict {
                ColorBand::STRICT_RED
            } else {
                ColorBand::RED
            }),
            threshold: *threshold,
        },
        ProbeConfig::Template {
            templates,
            confidence,
        } => {
            let mut library = TemplateLibrary::new(None);
            Probe::Template {
                templates: templates.iter().map(|p| library.get(p)).collect(),
                matcher: TemplateMatcher::with_default_backend(*confidence, 1, Arc::clone(events)),
            }
        }
    };

    let settings = DetectorSettings {
        name: config.name.clone(),
        nickname: config.nickname.clone(),
        region: config.region,
        poll_interval: config.poll_interval(),
        repeat: config.repeat.map(|r| RepeatPolicy {
            max_count: r.max_count,
            interval: Duration::from_millis(r.interval_ms),
        }),
        snapshot: config.snapshot,
    };

    Ok(PresenceDetector::new(
        settings,
        probe,
        backend.capture().map_err(platform)?,
        sink,
        Arc::clone(events),
    ))
}

/// Builds one key presser.
///
/// # Errors
///
/// Returns [`PixelJackError::Platform`] if the backend cannot open an
/// input handle.
pub fn build_presser(
    config: &KeyConfig,
    backend: &dyn Backend,
    events: &Arc<EventBus>,
) -> Result<KeyPresser, PixelJackError> {
    let schedule = KeySchedule::new(
        config.key,
        config.min_interval_secs,
        config.max_interval_secs,
        config.press_count,
    );
    Ok(KeyPresser::new(
        schedule,
        backend.input().map_err(platform)?,
        Arc::clone(events),
    ))
}

/// Picks the notification transport: Telegram when configured, the log
/// otherwise.
///
/// # Errors
///
/// Returns a [`NotifyError`] if the Telegram client cannot be built.
pub fn build_transport(
    config: Option<&NotifyConfig>,
) -> Result<Arc<dyn NotificationTransport>, NotifyError> {
    match config.and_then(|n| n.telegram.as_ref()) {
        Some(telegram) => Ok(Arc::new(TelegramTransport::new(
            &telegram.token,
            &telegram.chat_id,
            telegram.api_base.as_deref(),
            Duration::from_secs(telegram.timeout_secs),
        )?)),
        None => Ok(Arc::new(LogTransport)),
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl From<&ForwardConfig> for BridgeFilter {
    fn from(config: &ForwardConfig) -> Self {
        Self {
            trigger_onset: config.trigger_onset,
            sequence_completed: config.sequence_completed,
            errors: config.errors,
        }
    }
}

fn platform(e: impl std::fmt::Display) -> PixelJackError {
    PixelJackError::Platform(e.to_string())
}

// ============================================================================
// Runtime
// ============================================================================

/// Running engines plus their notification plumbing.
#[derive(Debug)]
pub struct Runtime {
    cancel: CancellationToken,
    clicker: Option<TaskHandle<ClickerEngine>>,
    alert: Option<TaskHandle<PresenceDetector>>,
    keys: Vec<TaskHandle<KeyPresser>>,
    notifier: Notifier,
    bridge: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Runtime {
    /// Builds and starts every configured engine, restricted to `only`
    /// when it is non-empty. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is selected to run, the notification
    /// transport cannot be built, or the backend fails to open a device.
    pub fn launch(
        config: &PixelJackConfig,
        backend: &dyn Backend,
        events: &Arc<EventBus>,
        only: &[EngineKind],
    ) -> Result<Self, PixelJackError> {
        let selected = |kind| only.is_empty() || only.contains(&kind);
        let clicker_cfg = config.clicker.as_ref().filter(|_| selected(EngineKind::Clicker));
        let alert_cfg = config.alert.as_ref().filter(|_| selected(EngineKind::Alert));
        let key_cfgs: &[KeyConfig] = if selected(EngineKind::Keys) {
            &config.keys
        } else {
            &[]
        };

        if clicker_cfg.is_none() && alert_cfg.is_none() && key_cfgs.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "engines".to_string(),
                value: "none".to_string(),
                expected: "at least one configured and selected engine".to_string(),
            }
            .into());
        }

        // build everything before spawning so a failure leaves nothing running
        let clicker = clicker_cfg
            .map(|c| build_clicker(c, backend, events))
            .transpose()?;
        let pressers = key_cfgs
            .iter()
            .map(|k| build_presser(k, backend, events))
            .collect::<Result<Vec<_>, _>>()?;

        let notify = config.notify.as_ref();
        let transport = build_transport(notify)?;
        let policy = notify.map(|n| RetryPolicy::from(&n.retry)).unwrap_or_default();
        let notifier = Notifier::spawn(transport, policy, Some(Arc::clone(events)));
        let sink = notifier.sink();

        // on error the dropped notifier's worker exits with its queue
        let detector = alert_cfg
            .map(|a| build_detector(a, backend, Arc::clone(&sink), events))
            .transpose()?;

        let cancel = CancellationToken::new();

        let filter = notify.map(|n| BridgeFilter::from(&n.forward)).unwrap_or_default();
        let bridge = (!filter.is_empty()).then(|| {
            let token = cancel.child_token();
            let handle = spawn_bridge(events, sink, filter, token.clone());
            (token, handle)
        });

        let runtime = Self {
            clicker: clicker.map(|e| TaskHandle::spawn(e, &cancel)),
            alert: detector.map(|e| TaskHandle::spawn(e, &cancel)),
            keys: pressers
                .into_iter()
                .map(|e| TaskHandle::spawn(e, &cancel))
                .collect(),
            cancel,
            notifier,
            bridge,
        };
        runtime.start_all();
        info!(
            backend = backend.name(),
            engines = ?runtime.engine_names(),
            "engines started"
        );
        Ok(runtime)
    }

    /// Names of the running engines.
    #[must_use]
    pub fn engine_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        names.extend(self.clicker.as_ref().map(TaskHandle::name));
        names.extend(self.alert.as_ref().map(TaskHandle::name));
        names.extend(self.keys.iter().map(TaskHandle::name));
        names
    }

    /// Sends `Start` to every engine. Running engines ignore it.
    pub fn start_all(&self) {
        self.for_each(Control::Start);
    }

    /// Sends `Stop` to every engine. The loops stay alive for a later
    /// [`start_all`](Self::start_all).
    pub fn stop_all(&self) {
        self.for_each(Control::Stop);
    }

    fn for_each(&self, cmd: Control) {
        let apply = |ok: bool, name: &str| {
            if !ok {
                warn!(engine = name, ?cmd, "engine loop is gone");
            }
        };
        if let Some(h) = &self.clicker {
            apply(h.send(cmd), h.name());
        }
        if let Some(h) = &self.alert {
            apply(h.send(cmd), h.name());
        }
        for h in &self.keys {
            apply(h.send(cmd), h.name());
        }
    }

    /// Stops every engine, then delivers queued notifications within
    /// `grace`. Returns `false` if some notifications were abandoned.
    pub async fn shutdown(self, grace: Duration) -> bool {
        if let Some(h) = self.clicker {
            h.shutdown().await;
        }
        if let Some(h) = self.alert {
            h.shutdown().await;
        }
        for h in self.keys {
            h.shutdown().await;
        }
        if let Some((token, handle)) = self.bridge {
            // the bridge flushes events already on the bus before exiting
            token.cancel();
            let _ = handle.await;
        }
        self.cancel.cancel();
        let drained = self.notifier.shutdown(grace).await;
        info!(drained, "runtime stopped");
        drained
    }
}
