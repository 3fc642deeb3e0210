//! Error types for `PixelJack`
//!
//! Every runtime failure inside an engine tick is absorbed and turned into
//! an event; only configuration and startup failures surface to the CLI,
//! through [`PixelJackError::exit_code`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for `PixelJack` CLI operations.
pub struct ExitCode;

impl ExitCode {
    /// Successful execution
    pub const SUCCESS: i32 = 0;

    /// General error
    pub const ERROR: i32 = 1;

    /// Configuration error (invalid YAML, validation failure)
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error (file not found, permission denied)
    pub const IO_ERROR: i32 = 3;

    /// Notification transport could not be set up
    pub const NOTIFY_ERROR: i32 = 4;

    /// Screen capture or input backend unavailable
    pub const PLATFORM_ERROR: i32 = 5;

    /// Usage error (invalid arguments, missing required options)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `PixelJack` operations.
#[derive(Debug, Error)]
pub enum PixelJackError {
    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Notification setup error
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// Platform backend could not be initialised
    #[error("platform unavailable: {0}")]
    Platform(String),

    /// Engine state machine error
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PixelJackError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Json(_) => ExitCode::CONFIG_ERROR,
            Self::Notify(_) => ExitCode::NOTIFY_ERROR,
            Self::Platform(_) => ExitCode::PLATFORM_ERROR,
            Self::Phase(_) => ExitCode::ERROR,
            Self::Io(_) => ExitCode::IO_ERROR,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed
    #[error("parse error in {path}: {message}")]
    ParseError {
        /// Path to the configuration file
        path: PathBuf,
        /// Line number where the error occurred (if available)
        line: Option<usize>,
        /// Error message from the parser
        message: String,
    },

    /// Configuration validation failed
    #[error("validation failed for {path}")]
    ValidationError {
        /// Path to the configuration file
        path: String,
        /// List of validation issues found
        errors: Vec<ValidationIssue>,
    },

    /// Referenced configuration file not found
    #[error("file not found: {path}")]
    MissingFile {
        /// Path to the missing file
        path: PathBuf,
    },

    /// Field has an invalid value
    #[error("invalid value for '{field}': got '{value}', expected {expected}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The actual value provided
        value: String,
        /// Description of what was expected
        expected: String,
    },

    /// Environment variable referenced in configuration is not set
    #[error("environment variable '{var}' not set (referenced at {location})")]
    EnvVarNotSet {
        /// Name of the environment variable
        var: String,
        /// Location in the configuration where it was referenced
        location: String,
    },
}

// ============================================================================
// Validation Types
// ============================================================================

/// A single validation issue found during configuration validation.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the problematic field (e.g., "clicker.sequence.phases[2].target")
    pub path: String,
    /// Description of the validation issue
    pub message: String,
    /// Severity level of the issue
    pub severity: Severity,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {} at {}", prefix, self.message, self.path)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Prevents the configuration from being used
    Error,
    /// Reported but does not prevent loading
    Warning,
}

// ============================================================================
// Vision Errors
// ============================================================================

/// A template asset that can never match.
///
/// Reported once per path; the template is treated as "not found" from
/// then on.
#[derive(Debug, Clone, Error)]
pub enum AssetError {
    /// The image file could not be read or decoded
    #[error("template {path} is unreadable: {reason}")]
    Unreadable {
        /// Template path
        path: PathBuf,
        /// Decoder or I/O message
        reason: String,
    },

    /// The template does not fit inside the searched region
    #[error(
        "template {path} ({template_width}x{template_height}) is larger than region ({region_width}x{region_height})"
    )]
    Oversized {
        /// Template path
        path: PathBuf,
        /// Template width in pixels
        template_width: u32,
        /// Template height in pixels
        template_height: u32,
        /// Region width in pixels
        region_width: u32,
        /// Region height in pixels
        region_height: u32,
    },
}

/// Transient screen grab failure. The tick is retried at the next interval.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The capture backend failed
    #[error("screen capture failed: {0}")]
    Backend(String),

    /// The returned buffer does not match the requested region
    #[error("capture returned {actual_width}x{actual_height}, expected {width}x{height}")]
    SizeMismatch {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Returned width
        actual_width: u32,
        /// Returned height
        actual_height: u32,
    },
}

/// Matcher failure for a single template variant. That variant is skipped
/// for the current tick only.
#[derive(Debug, Clone, Error)]
#[error("match failed for {template} (scale {scale}, angle {angle}): {reason}")]
pub struct MatchError {
    /// Template label
    pub template: String,
    /// Variant scale factor
    pub scale: f32,
    /// Variant rotation in degrees
    pub angle: f32,
    /// Backend message
    pub reason: String,
}

/// Input injection failure (mouse move, click, key press).
#[derive(Debug, Clone, Error)]
#[error("input injection failed: {0}")]
pub struct InputError(pub String);

// ============================================================================
// Sequence / Phase Errors
// ============================================================================

/// Failure while evaluating a phase. Aborts the active sequence and
/// restores trigger polling.
#[derive(Debug, Clone, Error)]
pub enum SequenceError {
    /// A click issued by a phase failed
    #[error("phase '{phase}' failed: {source}")]
    Input {
        /// Phase name
        phase: String,
        /// Underlying input error
        #[source]
        source: InputError,
    },

    /// A phase exceeded its configured timeout
    #[error("phase '{phase}' timed out after {elapsed:?}")]
    PhaseTimeout {
        /// Phase name
        phase: String,
        /// Time spent in the phase
        elapsed: Duration,
    },
}

/// Engine state machine errors.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Attempted invalid state transition
    #[error("invalid engine transition: {0}")]
    InvalidTransition(String),
}

// ============================================================================
// Notification Errors
// ============================================================================

/// Notification transport errors. Retried by the background worker with
/// bounded backoff, then dropped.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP request could not be sent or read. The request URL is stripped
    /// before wrapping since it embeds the bot token.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),

    /// The remote API answered with a non-success status
    #[error("rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Transport misconfiguration
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for `PixelJack` operations.
pub type Result<T> = std::result::Result<T, PixelJackError>;

// ============================================================================
// Tests
// ============================================================================
