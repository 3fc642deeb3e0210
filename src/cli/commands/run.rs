//! `run` command
//!
//! Loads the configuration, launches the selected engines and waits for
//! the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cli::args::RunArgs;
use crate::config::loader::ConfigLoader;
use crate::error::PixelJackError;
use crate::observability::{EventBus, EventEmitter};
use crate::platform::Backend;
use crate::platform::stub::StubBackend;
use crate::runtime::Runtime;

/// Size of the blank virtual screen used by `--stub`.
const STUB_SCREEN: (u32, u32) = (1920, 1080);

/// Run the configured engines until `cancel` fires.
///
/// # Errors
///
/// Returns a config error if loading fails, a platform error if the
/// desktop backend is unavailable, or a notify error if the Telegram
/// client cannot be built.
pub async fn run(args: &RunArgs, cancel: CancellationToken) -> Result<(), PixelJackError> {
    if let Some(port) = args.metrics_port {
        crate::observability::init_metrics(Some(port))?;
        tracing::info!(port, "Prometheus metrics endpoint started");
    }

    tracing::info!(config = %args.config.display(), "loading configuration");
    let load_result = ConfigLoader::with_defaults().load(&args.config)?;
    for warning in &load_result.warnings {
        tracing::warn!(
            location = warning.location.as_deref().unwrap_or("<unknown>"),
            "{}",
            warning.message
        );
    }
    let config = load_result.config;

    let events = Arc::new(match &args.events_file {
        Some(path) if path.as_os_str() == "-" => EventBus::with_emitter(EventEmitter::stdout()),
        Some(path) => EventBus::with_emitter(EventEmitter::from_file(path)?),
        None => EventBus::new(),
    });

    let backend = select_backend(args.stub)?;
    let runtime = Runtime::launch(&config, backend.as_ref(), &events, &args.only)?;

    cancel.cancelled().await;
    tracing::info!("shutdown requested");

    if !runtime.shutdown(Duration::from_secs(args.drain_secs)).await {
        tracing::warn!("some notifications were not delivered before shutdown");
    }
    Ok(())
}

fn select_backend(stub: bool) -> Result<Box<dyn Backend>, PixelJackError> {
    if stub {
        let (w, h) = STUB_SCREEN;
        return Ok(Box::new(StubBackend::dry_run(w, h)));
    }
    desktop_backend()
}

#[cfg(feature = "desktop")]
#[allow(clippy::unnecessary_wraps)]
fn desktop_backend() -> Result<Box<dyn Backend>, PixelJackError> {
    Ok(Box::new(crate::platform::desktop::DesktopBackend))
}

#[cfg(not(feature = "desktop"))]
fn desktop_backend() -> Result<Box<dyn Backend>, PixelJackError> {
    Err(PixelJackError::Platform(
        "built without the `desktop` feature; use --stub for a dry run".to_string(),
    ))
}
