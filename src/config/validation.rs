//! Configuration validation
//!
//! Semantic checks on a fully deserialized [`PixelJackConfig`]. Shape
//! errors (unknown fields, empty regions, bad key names) are already
//! rejected by serde; this pass covers values that parse but cannot run.
//!
//! Validation collects ALL errors (doesn't stop at first) to provide
//! comprehensive feedback to users.

use crate::config::loader::ConfigLimits;
use crate::config::schema::{
    AlertConfig, ClickerConfig, KeyConfig, NotifyConfig, PhaseConfig, PhaseKind, PixelJackConfig,
    ProbeConfig,
};
use crate::error::{Severity, ValidationIssue};
use crate::keys::{MAX_INTERVAL_SECS, MAX_PRESS_COUNT, MIN_INTERVAL_SECS};
use crate::vision::Invariance;

use std::collections::HashSet;

// ============================================================================
// Public API
// ============================================================================

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors (prevent loading).
    pub errors: Vec<ValidationIssue>,

    /// Validation warnings (informational).
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Returns `true` if there are any errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns `true` if validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Configuration validator.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    check_templates: bool,
}

impl Validator {
    /// Creates a new validator that does not touch the filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also warn about template files that do not exist.
    #[must_use]
    pub const fn check_templates(mut self, enabled: bool) -> Self {
        self.check_templates = enabled;
        self
    }

    /// Validates a configuration and returns the result.
    ///
    /// This method collects all errors and warnings rather than stopping
    /// at the first issue.
    pub fn validate(
        &mut self,
        config: &PixelJackConfig,
        limits: &ConfigLimits,
    ) -> ValidationResult {
        self.errors.clear();
        self.warnings.clear();

        if config.clicker.is_none() && config.alert.is_none() && config.keys.is_empty() {
            self.add_warning("", "No clicker, alert or keys configured; nothing will run");
        }

        if let Some(clicker) = &config.clicker {
            self.validate_clicker(clicker);
        }
        if let Some(alert) = &config.alert {
            self.validate_alert(alert);
        }
        for (i, key) in config.keys.iter().enumerate() {
            self.validate_key(key, &format!("keys[{i}]"));
        }
        if let Some(notify) = &config.notify {
            self.validate_notify(notify);
        }

        self.validate_limits(config, limits);

        if self.check_templates {
            self.validate_template_files(config);
        }

        ValidationResult {
            errors: std::mem::take(&mut self.errors),
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    // ========================================================================
    // Clicker
    // ========================================================================

    fn validate_clicker(&mut self, clicker: &ClickerConfig) {
        if clicker.trigger.templates.is_empty() {
            self.add_error(
                "clicker.trigger.templates",
                "At least one trigger template is required",
            );
        }
        if clicker.trigger.poll_interval_ms == 0 {
            self.add_error(
                "clicker.trigger.poll_interval_ms",
                "Poll interval must be greater than zero",
            );
        }
        if clicker.sequence.tick_interval_ms == 0 {
            self.add_error(
                "clicker.sequence.tick_interval_ms",
                "Tick interval must be greater than zero",
            );
        }
        if clicker.sequence.phases.is_empty() {
            self.add_error("clicker.sequence.phases", "At least one phase is required");
        }

        let matching = &clicker.matching;
        self.validate_confidence(matching.confidence, "clicker.matching.confidence");
        if matching.pyramid == 0 {
            self.add_error(
                "clicker.matching.pyramid",
                "Pyramid factor must be at least 1 (1 disables the pyramid)",
            );
        }
        if let Some(invariance) = &matching.invariance {
            self.validate_invariance(invariance, "clicker.matching.invariance");
        }

        let mut names = HashSet::new();
        for (i, phase) in clicker.sequence.phases.iter().enumerate() {
            let path = format!("clicker.sequence.phases[{i}]");
            if let Some(name) = &phase.name
                && !names.insert(name.as_str())
            {
                self.add_warning(&path, &format!("Duplicate phase name '{name}'"));
            }
            self.validate_phase(phase, &path);
        }
    }

    fn validate_phase(&mut self, phase: &PhaseConfig, path: &str) {
        if let Some(name) = &phase.name
            && name.trim().is_empty()
        {
            self.add_error(&format!("{path}.name"), "Phase name cannot be blank");
        }

        match (&phase.kind, phase.timeout_secs) {
            (PhaseKind::FixedWait { .. }, Some(_)) => {
                self.add_warning(
                    &format!("{path}.timeout_secs"),
                    "Timeout is ignored for fixed_wait phases",
                );
            }
            (_, Some(timeout)) if !(timeout.is_finite() && timeout > 0.0) => {
                self.add_error(
                    &format!("{path}.timeout_secs"),
                    "Timeout must be a positive number of seconds",
                );
            }
            _ => {}
        }

        match &phase.kind {
            PhaseKind::FixedWait { duration_secs } => {
                let d = *duration_secs;
                if !(d.is_finite() && d > 0.0) {
                    self.add_error(
                        &format!("{path}.duration_secs"),
                        "Fixed wait duration must be a positive number of seconds",
                    );
                } else if std::time::Duration::try_from_secs_f64(d).is_err() {
                    self.add_error(&format!("{path}.duration_secs"), "Fixed wait is too long");
                }
            }
            PhaseKind::ActUntilAbsent { target, actor, .. }
            | PhaseKind::ActUntilPresent { target, actor, .. } => {
                if target.as_os_str().is_empty() {
                    self.add_error(&format!("{path}.target"), "Target template is required");
                }
                if actor.as_os_str().is_empty() {
                    self.add_error(&format!("{path}.actor"), "Actor template is required");
                }
            }
            PhaseKind::WaitThenAct { target, .. } => {
                if target.as_os_str().is_empty() {
                    self.add_error(&format!("{path}.target"), "Target template is required");
                }
            }
        }
    }

    fn validate_invariance(&mut self, invariance: &Invariance, path: &str) {
        let scales = invariance.scales;
        if !(scales.min > 0.0 && scales.max.is_finite()) {
            self.add_error(&format!("{path}.scales"), "Scale factors must be positive");
        }
        if scales.max > scales.min && scales.step <= 0.0 {
            self.add_warning(
                &format!("{path}.scales.step"),
                "Non-positive step; only the minimum scale is tried",
            );
        }
        let angles = invariance.angles;
        if !(angles.min.is_finite() && angles.max.is_finite()) {
            self.add_error(&format!("{path}.angles"), "Angles must be finite");
        }
        if angles.max > angles.min && angles.step <= 0.0 {
            self.add_warning(
                &format!("{path}.angles.step"),
                "Non-positive step; only the minimum angle is tried",
            );
        }
    }

    // ========================================================================
    // Alert
    // ========================================================================

    fn validate_alert(&mut self, alert: &AlertConfig) {
        if alert.name.trim().is_empty() {
            self.add_error("alert.name", "Alert name cannot be empty");
        }
        if alert.poll_interval_ms == 0 {
            self.add_error(
                "alert.poll_interval_ms",
                "Poll interval must be greater than zero",
            );
        }

        match &alert.probe {
            ProbeConfig::RedPixels { threshold, .. } => {
                if *threshold == 0 {
                    self.add_error(
                        "alert.probe.threshold",
                        "Threshold must be at least 1 (0 would always be present)",
                    );
                }
                let area = u64::from(alert.region.width()) * u64::from(alert.region.height());
                if u64::from(*threshold) > area {
                    self.add_warning(
                        "alert.probe.threshold",
                        &format!("Threshold exceeds the region's {area} pixels; never present"),
                    );
                }
            }
            ProbeConfig::Template {
                templates,
                confidence,
            } => {
                if templates.is_empty() {
                    self.add_error(
                        "alert.probe.templates",
                        "At least one template is required",
                    );
                }
                self.validate_confidence(*confidence, "alert.probe.confidence");
            }
        }

        if let Some(repeat) = &alert.repeat {
            if repeat.max_count == 0 {
                self.add_error("alert.repeat.max_count", "Max count must be at least 1");
            }
            if repeat.interval_ms == 0 {
                self.add_error(
                    "alert.repeat.interval_ms",
                    "Repeat interval must be greater than zero",
                );
            }
        }
    }

    // ========================================================================
    // Keys
    // ========================================================================

    fn validate_key(&mut self, key: &KeyConfig, path: &str) {
        let (min, max) = (key.min_interval_secs, key.max_interval_secs);
        if !min.is_finite() || !max.is_finite() {
            self.add_error(path, "Key intervals must be finite numbers");
            return;
        }
        if min < MIN_INTERVAL_SECS {
            self.add_error(
                &format!("{path}.min_interval_secs"),
                &format!("Minimum interval must be at least {MIN_INTERVAL_SECS}s"),
            );
        }
        if max > MAX_INTERVAL_SECS {
            self.add_error(
                &format!("{path}.max_interval_secs"),
                &format!("Maximum interval must be at most {MAX_INTERVAL_SECS}s"),
            );
        }
        if max < min {
            self.add_warning(
                &format!("{path}.max_interval_secs"),
                "Maximum interval is below the minimum; the minimum is used",
            );
        }
        if key.press_count == 0 || key.press_count > MAX_PRESS_COUNT {
            self.add_error(
                &format!("{path}.press_count"),
                &format!("Press count must be between 1 and {MAX_PRESS_COUNT}"),
            );
        }
    }

    // ========================================================================
    // Notify
    // ========================================================================

    fn validate_notify(&mut self, notify: &NotifyConfig) {
        if let Some(telegram) = &notify.telegram {
            if telegram.token.trim().is_empty() {
                self.add_error("notify.telegram.token", "Bot token cannot be empty");
            }
            if telegram.chat_id.trim().is_empty() {
                self.add_error("notify.telegram.chat_id", "Chat id cannot be empty");
            }
            if telegram.timeout_secs == 0 {
                self.add_error(
                    "notify.telegram.timeout_secs",
                    "Request timeout must be greater than zero",
                );
            }
            if let Some(base) = &telegram.api_base
                && !(base.starts_with("http://") || base.starts_with("https://"))
            {
                self.add_error(
                    "notify.telegram.api_base",
                    "API base must be an http(s) URL",
                );
            }
        }
        if notify.retry.max_attempts == 0 {
            self.add_error("notify.retry.max_attempts", "At least one attempt is required");
        }
        if notify.retry.max_backoff_ms < notify.retry.initial_backoff_ms {
            self.add_warning(
                "notify.retry.max_backoff_ms",
                "Maximum backoff is below the initial backoff",
            );
        }
    }

    // ========================================================================
    // Limits and files
    // ========================================================================

    fn validate_limits(&mut self, config: &PixelJackConfig, limits: &ConfigLimits) {
        let phases = config
            .clicker
            .as_ref()
            .map_or(0, |c| c.sequence.phases.len());
        if phases > limits.max_phases {
            self.add_error(
                "clicker.sequence.phases",
                &format!(
                    "Too many phases: {phases} (max {}). Set PIXELJACK_MAX_PHASES to increase.",
                    limits.max_phases
                ),
            );
        }

        let templates = config.template_paths().len();
        if templates > limits.max_templates {
            self.add_error(
                "",
                &format!(
                    "Too many template references: {templates} (max {}). Set PIXELJACK_MAX_TEMPLATES to increase.",
                    limits.max_templates
                ),
            );
        }

        if let Some(inv) = config
            .clicker
            .as_ref()
            .and_then(|c| c.matching.invariance.as_ref())
        {
            let variants = inv.variant_count();
            if variants > limits.max_variants {
                self.add_error(
                    "clicker.matching.invariance",
                    &format!(
                        "Too many template variants: {variants} (max {}). Coarsen the steps or set PIXELJACK_MAX_VARIANTS to increase.",
                        limits.max_variants
                    ),
                );
            }
            let largest = inv.scales.max.max(inv.scales.min);
            if largest > limits.max_scale {
                self.add_error(
                    "clicker.matching.invariance.scales.max",
                    &format!(
                        "Scale {largest} exceeds the maximum of {}. Set PIXELJACK_MAX_SCALE to increase.",
                        limits.max_scale
                    ),
                );
            }
        }

        if config.keys.len() > limits.max_key_pressers {
            self.add_error(
                "keys",
                &format!(
                    "Too many key pressers: {} (max {}). Set PIXELJACK_MAX_KEY_PRESSERS to increase.",
                    config.keys.len(),
                    limits.max_key_pressers
                ),
            );
        }
    }

    fn validate_template_files(&mut self, config: &PixelJackConfig) {
        let mut seen = HashSet::new();
        for path in config.template_paths() {
            if seen.insert(path) && !path.is_file() {
                self.add_warning(
                    &path.display().to_string(),
                    &format!("Template {} not found; it will never match", path.display()),
                );
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn validate_confidence(&mut self, confidence: f32, path: &str) {
        if !(0.0..=1.0).contains(&confidence) {
            self.add_error(path, "Confidence must be between 0 and 1");
        }
    }

    fn add_error(&mut self, path: &str, message: &str) {
        self.errors.push(ValidationIssue {
            path: path.to_string(),
            message: message.to_string(),
            severity: Severity::Error,
        });
    }

    fn add_warning(&mut self, path: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            path: path.to_string(),
            message: message.to_string(),
            severity: Severity::Warning,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
