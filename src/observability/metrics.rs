//! Metrics collection for `PixelJack`.
//!
//! Provides Prometheus-compatible metrics through the `metrics` facade.
//! Every recording helper is a silent no-op until [`init_metrics`]
//! installs a recorder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::PixelJackError;
use crate::observability::events::{ErrorKind, SequenceOutcome};
use crate::platform::ClickType;

/// Guard to prevent double-initialization of the metrics recorder.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the global metrics recorder.
///
/// When `port` is `Some`, a Prometheus HTTP listener is started on
/// `127.0.0.1:<port>`. When `None`, the recorder is installed without
/// an HTTP endpoint.
///
/// # Errors
///
/// Returns `PixelJackError::Io` if the recorder or HTTP listener
/// cannot be installed (e.g. port already in use).
pub fn init_metrics(port: Option<u16>) -> Result<(), PixelJackError> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| PixelJackError::Io(std::io::Error::other(e.to_string())))?;

    describe_metrics();
    Ok(())
}

/// Registers metric descriptions with the global recorder.
fn describe_metrics() {
    describe_counter!("pixeljack_polls_total", "Region polls by engine");
    describe_histogram!(
        "pixeljack_capture_duration_ms",
        "Screen capture plus match time per tick in milliseconds"
    );
    describe_counter!("pixeljack_matches_total", "Accepted template matches");
    describe_counter!("pixeljack_clicks_total", "Injected clicks by click type");
    describe_counter!("pixeljack_trigger_onsets_total", "Trigger handoffs");
    describe_counter!(
        "pixeljack_phase_transitions_total",
        "Phases completed, by phase name"
    );
    describe_counter!("pixeljack_sequences_total", "Finished sequences by outcome");
    describe_histogram!(
        "pixeljack_sequence_duration_ms",
        "Sequence wall time in milliseconds"
    );
    describe_gauge!(
        "pixeljack_engine_state",
        "Current clicker state (1 = active)"
    );
    describe_counter!("pixeljack_alerts_total", "Presence alerts by kind");
    describe_counter!("pixeljack_key_presses_total", "Injected key presses");
    describe_counter!(
        "pixeljack_notifications_total",
        "Notification deliveries by result"
    );
    describe_counter!(
        "pixeljack_errors_total",
        "Absorbed errors by category"
    );
}

/// Records one poll of a region.
pub fn record_poll(engine: &'static str) {
    counter!("pixeljack_polls_total", "engine" => engine).increment(1);
}

/// Records the time spent capturing and matching during one tick.
pub fn record_capture_duration(engine: &'static str, duration: Duration) {
    histogram!("pixeljack_capture_duration_ms", "engine" => engine)
        .record(duration.as_secs_f64() * 1000.0);
}

/// Records an accepted template match.
pub fn record_match() {
    counter!("pixeljack_matches_total").increment(1);
}

/// Records an injected click.
pub fn record_click(click: ClickType) {
    let label = match click {
        ClickType::Single => "single",
        ClickType::Double => "double",
    };
    counter!("pixeljack_clicks_total", "click" => label).increment(1);
}

/// Records a trigger handoff.
pub fn record_trigger_onset() {
    counter!("pixeljack_trigger_onsets_total").increment(1);
}

/// Records a completed phase.
///
/// Phase names come from user config and are sanitized before use as a
/// label.
pub fn record_phase_transition(phase_name: &str) {
    counter!(
        "pixeljack_phase_transitions_total",
        "phase" => sanitize_phase_label(phase_name)
    )
    .increment(1);
}

/// Records a finished sequence.
pub fn record_sequence(outcome: SequenceOutcome, duration: Duration) {
    counter!("pixeljack_sequences_total", "outcome" => outcome.as_str()).increment(1);
    histogram!("pixeljack_sequence_duration_ms").record(duration.as_secs_f64() * 1000.0);
}

/// Sets the clicker state gauge.
///
/// Zeros out the previous state label (if any) before setting the new one,
/// preventing stale labels from showing `1.0` in Prometheus.
pub fn set_engine_state(state: &'static str, previous: Option<&'static str>) {
    if let Some(prev) = previous {
        gauge!("pixeljack_engine_state", "state" => prev).set(0.0);
    }
    gauge!("pixeljack_engine_state", "state" => state).set(1.0);
}

/// Records a presence alert (`detected`, `repeat` or `cleared`).
pub fn record_alert(kind: &'static str) {
    counter!("pixeljack_alerts_total", "kind" => kind).increment(1);
}

/// Records injected key presses.
pub fn record_key_presses(count: u32) {
    counter!("pixeljack_key_presses_total").increment(u64::from(count));
}

/// Records a notification delivery attempt outcome
/// (`sent`, `retried` or `dropped`).
pub fn record_notification(result: &'static str) {
    counter!("pixeljack_notifications_total", "result" => result).increment(1);
}

/// Records an absorbed error by category.
pub fn record_error(kind: ErrorKind) {
    counter!("pixeljack_errors_total", "category" => kind.as_str()).increment(1);
}

/// Maximum length for phase name labels.
const MAX_PHASE_LABEL_LEN: usize = 64;

/// Truncates to [`MAX_PHASE_LABEL_LEN`] characters and replaces any
/// characters invalid in Prometheus labels with underscores.
fn sanitize_phase_label(name: &str) -> String {
    name.chars()
        .take(MAX_PHASE_LABEL_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_label_is_sanitized_and_truncated() {
        assert_eq!(sanitize_phase_label("open menu!"), "open_menu_");
        assert_eq!(sanitize_phase_label(&"x".repeat(500)).len(), MAX_PHASE_LABEL_LEN);
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        // metrics macros silently no-op when no global recorder is installed
        record_poll("clicker");
        record_capture_duration("clicker", Duration::from_millis(12));
        record_match();
        record_click(ClickType::Double);
        record_trigger_onset();
        record_phase_transition("wait");
        record_sequence(SequenceOutcome::Completed, Duration::from_secs(200));
        set_engine_state("polling", Some("idle"));
        record_alert("repeat");
        record_key_presses(3);
        record_notification("dropped");
        record_error(ErrorKind::Capture);
    }
}
