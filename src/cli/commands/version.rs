//! Version information display
//!
//! Prints version and enabled platform features in human or JSON format.

use crate::cli::args::{OutputFormat, VersionArgs};

/// Platform backends compiled into this binary.
#[must_use]
pub fn backends() -> Vec<&'static str> {
    let mut out = vec!["stub"];
    if cfg!(feature = "desktop") {
        out.push("desktop");
    }
    out
}

/// Print version and build information.
pub fn run(args: &VersionArgs) {
    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    let backends = backends();

    match args.format {
        OutputFormat::Human => {
            println!("{name} {version}");
            println!("backends: {}", backends.join(", "));
        }
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "name": name,
                "version": version,
                "backends": backends,
            });
            println!("{doc}");
        }
    }
}
