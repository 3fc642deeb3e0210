//! Single-owner control loop for timer-driven engines.
//!
//! Each engine is moved into its own task. The task is the only code that
//! touches the engine: it sleeps until the deadline the engine asked for,
//! calls [`Scheduled::tick`], and applies `Start`/`Stop` commands that
//! arrive over a channel. Cancelling the token stops the engine and hands
//! it back through [`TaskHandle::shutdown`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A timer-driven engine.
///
/// Every method does bounded work and returns immediately; the engine
/// never sleeps itself.
pub trait Scheduled: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Starts the engine. Returns the first deadline, or `None` if it was
    /// already running (no second timer is created).
    fn start(&mut self, now: Instant) -> Option<Instant>;

    /// Stops the engine and discards in-flight state. Idempotent.
    fn stop(&mut self);

    /// Runs one unit of work. Returns the next deadline, or `None` when
    /// the engine has nothing left to do until started again.
    fn tick(&mut self, now: Instant) -> Option<Instant>;
}

/// Command sent to a running control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Start (no-op if running).
    Start,
    /// Stop (no-op if idle).
    Stop,
}

/// Handle to an engine's control loop.
#[derive(Debug)]
pub struct TaskHandle<S> {
    name: String,
    tx: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    join: JoinHandle<S>,
}

impl<S: Scheduled> TaskHandle<S> {
    /// Moves `engine` into a new control loop. The loop ends when `parent`
    /// or the handle's own token is cancelled.
    #[must_use]
    pub fn spawn(engine: S, parent: &CancellationToken) -> Self {
        let name = engine.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let join = tokio::spawn(drive(engine, rx, cancel.clone()));
        Self {
            name,
            tx,
            cancel,
            join,
        }
    }

    /// Name of the engine.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests a start. Returns `false` if the loop has exited.
    pub fn start(&self) -> bool {
        self.send(Control::Start)
    }

    /// Requests a stop. Returns `false` if the loop has exited.
    pub fn stop(&self) -> bool {
        self.send(Control::Stop)
    }

    /// Delivers `cmd` to the loop. Returns `false` if the loop has exited.
    pub fn send(&self, cmd: Control) -> bool {
        let sent = self.tx.send(cmd).is_ok();
        if !sent {
            debug!(engine = %self.name, ?cmd, "control loop already exited");
        }
        sent
    }

    /// Cancels the loop and returns the stopped engine, or `None` if the
    /// task panicked.
    pub async fn shutdown(self) -> Option<S> {
        self.cancel.cancel();
        match self.join.await {
            Ok(engine) => Some(engine),
            Err(e) => {
                warn!(engine = %self.name, error = %e, "control loop ended abnormally");
                None
            }
        }
    }
}

async fn drive<S: Scheduled>(
    mut engine: S,
    mut rx: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
) -> S {
    let mut deadline: Option<Instant> = None;
    loop {
        let at = deadline;
        let wake = async move {
            match at {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(Control::Start) => {
                    if let Some(first) = engine.start(Instant::now()) {
                        deadline = Some(first);
                    }
                }
                Some(Control::Stop) => {
                    engine.stop();
                    deadline = None;
                }
                None => break,
            },
            () = wake => {
                deadline = engine.tick(Instant::now());
            }
        }
    }
    engine.stop();
    debug!(engine = engine.name(), "control loop exited");
    engine
}
