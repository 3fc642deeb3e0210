//! Configuration schema types.
//!
//! These types are deserialized from the YAML configuration file. Every
//! section is optional so one file can drive any subset of the engines.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platform::{ClickType, Key};
use crate::vision::{ColorBand, Invariance, Region};

// ============================================================================
// Top-Level Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PixelJackConfig {
    /// Trigger-then-sequence clicker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clicker: Option<ClickerConfig>,

    /// Presence alert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertConfig>,

    /// Timed key pressers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<KeyConfig>,

    /// Notification delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<NotifyConfig>,
}

// ============================================================================
// Clicker
// ============================================================================

/// Clicker engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickerConfig {
    /// Trigger detection
    pub trigger: TriggerConfig,

    /// Phase sequence started by the trigger
    pub sequence: SequenceConfig,

    /// Template matching parameters
    #[serde(default)]
    pub matching: MatchingConfig,
}

/// Trigger watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    /// Region searched for trigger templates
    pub region: Region,

    /// Trigger templates, tried in order
    pub templates: Vec<PathBuf>,

    /// Time between polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Click issued on the matched trigger
    #[serde(default)]
    pub click: ClickType,
}

impl TriggerConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Phase sequence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceConfig {
    /// Region searched by the phases; defaults to the trigger region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    /// Time between sequencer ticks in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Ordered phases
    pub phases: Vec<PhaseConfig>,
}

impl SequenceConfig {
    /// Tick interval as a [`Duration`].
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// One phase of the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Display name; defaults to `phase-{index}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Time limit in seconds (matching phases only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    /// What happens when the time limit runs out
    #[serde(default)]
    pub on_timeout: TimeoutBehavior,

    /// Phase behaviour
    #[serde(flatten)]
    pub kind: PhaseKind,
}

/// Phase behaviour, selected by the `kind` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseKind {
    /// Click `actor` while `target` is visible; advance when it is gone
    ActUntilAbsent {
        /// Template that must disappear
        target: PathBuf,
        /// Template clicked while waiting
        actor: PathBuf,
        /// Click type
        #[serde(default)]
        click: ClickType,
    },

    /// Click `actor` until `target` is visible
    ActUntilPresent {
        /// Template that must appear
        target: PathBuf,
        /// Template clicked while waiting
        actor: PathBuf,
        /// Click type
        #[serde(default)]
        click: ClickType,
    },

    /// Wait some ticks, click `target` if visible, advance either way
    WaitThenAct {
        /// Optional click target
        target: PathBuf,
        /// Ticks to wait after arming
        #[serde(default)]
        wait_ticks: u32,
        /// Click type
        #[serde(default)]
        click: ClickType,
    },

    /// Wait a fixed time
    FixedWait {
        /// Wait in seconds
        duration_secs: f64,
    },
}

impl PhaseKind {
    /// Template paths referenced by this phase.
    #[must_use]
    pub fn templates(&self) -> Vec<&PathBuf> {
        match self {
            Self::ActUntilAbsent { target, actor, .. }
            | Self::ActUntilPresent { target, actor, .. } => vec![target, actor],
            Self::WaitThenAct { target, .. } => vec![target],
            Self::FixedWait { .. } => Vec::new(),
        }
    }

    fn templates_mut(&mut self) -> Vec<&mut PathBuf> {
        match self {
            Self::ActUntilAbsent { target, actor, .. }
            | Self::ActUntilPresent { target, actor, .. } => vec![target, actor],
            Self::WaitThenAct { target, .. } => vec![target],
            Self::FixedWait { .. } => Vec::new(),
        }
    }
}

/// Behaviour when a phase exceeds `timeout_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBehavior {
    /// Abort the sequence and resume trigger polling
    #[default]
    Abort,
    /// Move on to the next phase
    Advance,
}

/// Template matching parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    /// Minimum confidence in `[0, 1]`
    pub confidence: f32,

    /// Coarse-to-fine downscale factor (1 disables)
    pub pyramid: u32,

    /// Scale/rotation variants; `None` matches the template as-is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invariance: Option<Invariance>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            pyramid: 1,
            invariance: None,
        }
    }
}

// ============================================================================
// Alert
// ============================================================================

/// Presence alert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertConfig {
    /// Detector name in events and logs
    #[serde(default = "default_alert_name")]
    pub name: String,

    /// Name used in notification texts
    #[serde(default = "default_nickname")]
    pub nickname: String,

    /// Sampled region
    pub region: Region,

    /// Time between samples in milliseconds
    #[serde(default = "default_alert_poll_ms")]
    pub poll_interval_ms: u64,

    /// How presence is measured
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Escalation while present; omitted sends one alert per detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatConfig>,

    /// Attach a PNG of the region to the detection alert
    #[serde(default)]
    pub snapshot: bool,
}

impl AlertConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Presence probe, selected by the `kind` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProbeConfig {
    /// Count red pixels
    RedPixels {
        /// Pixels needed for "present"
        #[serde(default = "default_red_threshold")]
        threshold: u32,
        /// Exactly `(255, 0, 0)` instead of the default band
        #[serde(default)]
        strict: bool,
        /// Custom band; overrides `strict`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        band: Option<ColorBand>,
    },

    /// Match templates
    Template {
        /// Templates, tried in order
        templates: Vec<PathBuf>,
        /// Minimum confidence
        #[serde(default = "default_confidence")]
        confidence: f32,
    },
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::RedPixels {
            threshold: default_red_threshold(),
            strict: false,
            band: None,
        }
    }
}

/// Escalation schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepeatConfig {
    /// Alerts per detection, including the first
    pub max_count: u32,

    /// Time between alerts in milliseconds
    pub interval_ms: u64,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            max_count: 10,
            interval_ms: 6000,
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Timed key presser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    /// Key name (`space`, `enter`, `f`, ...)
    pub key: Key,

    /// Shortest wait between cycles in seconds
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: f64,

    /// Longest wait between cycles in seconds
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: f64,

    /// Presses per cycle
    #[serde(default = "default_press_count")]
    pub press_count: u32,
}

// ============================================================================
// Notify
// ============================================================================

/// Notification delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    /// Telegram bot; notifications are only logged when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Lifecycle events forwarded as notifications
    #[serde(default)]
    pub forward: ForwardConfig,
}

/// Telegram bot credentials.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    /// Bot token
    pub token: String,

    /// Target chat id
    pub chat_id: String,

    /// API base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

// token must not end up in logs
impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("chat_id", &self.chat_id)
            .field("api_base", &self.api_base)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

/// Delivery retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per notification
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

/// Events forwarded as notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardConfig {
    /// Trigger onsets
    pub trigger_onset: bool,

    /// Finished sequences
    pub sequence_completed: bool,

    /// Absorbed errors
    pub errors: bool,
}

// ============================================================================
// Path resolution
// ============================================================================

impl PixelJackConfig {
    /// Every template path in the file, in declaration order.
    #[must_use]
    pub fn template_paths(&self) -> Vec<&PathBuf> {
        let mut paths = Vec::new();
        if let Some(clicker) = &self.clicker {
            paths.extend(&clicker.trigger.templates);
            for phase in &clicker.sequence.phases {
                paths.extend(phase.kind.templates());
            }
        }
        if let Some(AlertConfig {
            probe: ProbeConfig::Template { templates, .. },
            ..
        }) = &self.alert
        {
            paths.extend(templates);
        }
        paths
    }

    /// Rewrites relative template paths to be relative to `base`.
    pub fn resolve_paths(&mut self, base: &std::path::Path) {
        let mut fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(clicker) = &mut self.clicker {
            clicker.trigger.templates.iter_mut().for_each(&mut fix);
            for phase in &mut clicker.sequence.phases {
                phase.kind.templates_mut().into_iter().for_each(&mut fix);
            }
        }
        if let Some(AlertConfig {
            probe: ProbeConfig::Template { templates, .. },
            ..
        }) = &mut self.alert
        {
            templates.iter_mut().for_each(&mut fix);
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

/// Default match confidence.
pub const DEFAULT_CONFIDENCE: f32 = 0.8;

const fn default_poll_interval_ms() -> u64 {
    3000
}

const fn default_tick_interval_ms() -> u64 {
    500
}

fn default_alert_name() -> String {
    "alert".to_string()
}

fn default_nickname() -> String {
    "user".to_string()
}

const fn default_alert_poll_ms() -> u64 {
    500
}

const fn default_red_threshold() -> u32 {
    1
}

const fn default_confidence() -> f32 {
    DEFAULT_CONFIDENCE
}

const fn default_min_interval() -> f64 {
    5.0
}

const fn default_max_interval() -> f64 {
    10.0
}

const fn default_press_count() -> u32 {
    1
}

const fn default_request_timeout_secs() -> u64 {
    10
}
