//! `validate` command
//!
//! Runs the full loading pipeline on each file and reports every issue.
//! Files are checked independently; the first failure decides the exit
//! code after all files have been reported.

use std::path::Path;

use serde::Serialize;

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::config::loader::ConfigLoader;
use crate::error::{ConfigError, PixelJackError, Severity, ValidationIssue};

/// Outcome for one file.
#[derive(Debug, Serialize)]
pub struct FileReport {
    /// File as given on the command line.
    pub file: String,
    /// `true` if the file can be run.
    pub valid: bool,
    /// Blocking issues.
    pub errors: Vec<IssueReport>,
    /// Non-blocking issues.
    pub warnings: Vec<IssueReport>,
}

/// One reported issue.
#[derive(Debug, Serialize)]
pub struct IssueReport {
    /// Field path, or the file location for loader warnings.
    pub path: String,
    /// Description.
    pub message: String,
}

impl From<&ValidationIssue> for IssueReport {
    fn from(issue: &ValidationIssue) -> Self {
        Self {
            path: issue.path.clone(),
            message: issue.message.clone(),
        }
    }
}

/// Validates one file.
///
/// Returns the report and, if the file is not valid, the error that made
/// it fail. With `strict`, warnings fail the file too.
#[must_use]
pub fn check_file(path: &Path, strict: bool) -> (FileReport, Option<ConfigError>) {
    let mut report = FileReport {
        file: path.display().to_string(),
        valid: false,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    match ConfigLoader::with_defaults().load(path) {
        Ok(result) => {
            report.warnings = result
                .warnings
                .iter()
                .map(|w| IssueReport {
                    path: w.location.clone().unwrap_or_default(),
                    message: w.message.clone(),
                })
                .collect();
            if strict && !report.warnings.is_empty() {
                let as_errors = result
                    .warnings
                    .into_iter()
                    .map(|w| ValidationIssue {
                        path: w.location.unwrap_or_default(),
                        message: w.message,
                        severity: Severity::Error,
                    })
                    .collect();
                return (
                    report,
                    Some(ConfigError::ValidationError {
                        path: path.display().to_string(),
                        errors: as_errors,
                    }),
                );
            }
            report.valid = true;
            (report, None)
        }
        Err(e) => {
            match &e {
                ConfigError::ValidationError { errors, .. } => {
                    report.errors = errors.iter().map(IssueReport::from).collect();
                }
                other => report.errors.push(IssueReport {
                    path: String::new(),
                    message: other.to_string(),
                }),
            }
            (report, Some(e))
        }
    }
}

/// Validate configuration files.
///
/// # Errors
///
/// Returns the first file's [`ConfigError`] if any file is invalid.
pub fn run(args: &ValidateArgs) -> Result<(), PixelJackError> {
    let mut reports = Vec::with_capacity(args.files.len());
    let mut first_error = None;

    for path in &args.files {
        tracing::info!(file = %path.display(), "validating configuration");
        let (report, error) = check_file(path, args.strict);
        if first_error.is_none() {
            first_error = error;
        }
        reports.push(report);
    }

    match args.format {
        OutputFormat::Human => {
            for report in &reports {
                print_human(report);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
    }

    first_error.map_or(Ok(()), |e| Err(e.into()))
}

fn print_human(report: &FileReport) {
    let mark = if report.valid { "ok" } else { "FAILED" };
    println!("{}: {mark}", report.file);
    for issue in &report.errors {
        println!("  error: {}{}", issue.message, at(&issue.path));
    }
    for issue in &report.warnings {
        println!("  warning: {}{}", issue.message, at(&issue.path));
    }
}

fn at(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!(" (at {path})")
    }
}
