//! `PixelJack` - screen-driven game automation

use clap::Parser;
use tokio_util::sync::CancellationToken;

use pixeljack::cli::args::Cli;
use pixeljack::cli::commands;
use pixeljack::error::ExitCode;
use pixeljack::observability::{LogFormat, init_logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if !cli.quiet {
        init_logging(LogFormat::from(cli.log_format), cli.verbose, cli.color);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(handle_signals(cancel.clone()));

    let result = commands::dispatch(cli, cancel).await;

    match result {
        Ok(()) => std::process::exit(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

/// First signal cancels `cancel` for a graceful stop; a second one exits
/// immediately.
#[cfg(unix)]
async fn handle_signals(cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        eprintln!("warning: SIGTERM handler unavailable, only Ctrl+C stops gracefully");
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
        return;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    eprintln!("\nShutting down gracefully... (press Ctrl+C again to force)");
    cancel.cancel();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => std::process::exit(ExitCode::INTERRUPTED),
        _ = sigterm.recv() => std::process::exit(ExitCode::TERMINATED),
    }
}

#[cfg(not(unix))]
async fn handle_signals(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nShutting down gracefully... (press Ctrl+C again to force)");
        cancel.cancel();
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(ExitCode::INTERRUPTED);
    }
}
