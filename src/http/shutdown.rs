//! Graceful shutdown and signal handling.
//!
//! The coordinator moves through `Idle → Armed → Draining → Closed`. Arming
//! registers SIGTERM and SIGINT and spawns a task that waits for either (or for
//! a `ShutdownTrigger`). On receipt every listener stops accepting, in-flight
//! connections get up to the drain timeout, and anything still open afterwards
//! is closed forcibly and reported to the drain error handler. Errors the
//! listeners return while closing are reported the same way, through a
//! `CloseReport`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

use crate::config::DrainErrorHandler;
use crate::error::{DrainError, ServerError};

/// How often open connections are counted while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Armed,
    Draining,
    Closed,
}

impl DrainState {
    /// True once a shutdown has begun. A listener that exits in this state was
    /// closed deliberately.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, DrainState::Draining | DrainState::Closed)
    }
}

/// Requests a graceful shutdown without a process signal.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    notify: Arc<Notify>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // notify_one stores a permit, so a trigger before the coordinator waits is kept
        self.notify.notify_one();
    }
}

/// Process signal registration, owned by the coordinator task and released
/// when it is dropped.
pub struct SignalSubscription {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(not(unix))]
    ctrl_c: tokio::signal::windows::CtrlC,
}

impl SignalSubscription {
    /// Register handlers now, so a signal sent right after this returns is seen.
    #[cfg(unix)]
    pub fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    /// Wait for the next signal and return its name.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        self.ctrl_c.recv().await;
        "Ctrl+C"
    }
}

/// Carries the listeners' close outcome from `listen_and_serve` to the
/// coordinator task. Dropping it unsent reports a clean close.
#[derive(Debug)]
pub struct CloseReport {
    tx: oneshot::Sender<Option<DrainError>>,
}

impl CloseReport {
    pub fn send(self, failure: Option<DrainError>) {
        let _ = self.tx.send(failure);
    }
}

pub struct ShutdownCoordinator {
    state: watch::Sender<DrainState>,
    trigger: Arc<Notify>,
    listeners: Vec<Handle>,
    timeout: Duration,
    error_handler: Arc<dyn DrainErrorHandler>,
}

impl ShutdownCoordinator {
    pub fn new(
        listeners: Vec<Handle>,
        timeout: Duration,
        error_handler: Arc<dyn DrainErrorHandler>,
    ) -> Self {
        let (state, _) = watch::channel(DrainState::Idle);
        Self {
            state,
            trigger: Arc::new(Notify::new()),
            listeners,
            timeout,
            error_handler,
        }
    }

    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            notify: self.trigger.clone(),
        }
    }

    /// `Idle → Armed`: register signal handlers and spawn the coordinator task.
    ///
    /// The task does not reach `Closed` until the returned `CloseReport` has
    /// been sent or dropped. Fails with `AlreadyStarted` unless the coordinator
    /// is idle.
    pub fn arm(&self) -> Result<(JoinHandle<()>, CloseReport), ServerError> {
        if self.state() != DrainState::Idle {
            return Err(ServerError::AlreadyStarted);
        }
        let signals = SignalSubscription::register().map_err(ServerError::Signal)?;
        self.state.send_replace(DrainState::Armed);
        tracing::debug!("Shutdown handler armed for SIGTERM and SIGINT");

        let (tx, closed) = oneshot::channel();
        let task = DrainTask {
            state: self.state.clone(),
            trigger: self.trigger.clone(),
            listeners: self.listeners.clone(),
            timeout: self.timeout,
            error_handler: self.error_handler.clone(),
            closed,
        };
        Ok((tokio::spawn(task.run(signals)), CloseReport { tx }))
    }

    /// Force the terminal state after a fatal listener error. The coordinator
    /// task must already have been aborted.
    pub(crate) fn abandon(&self) {
        for handle in &self.listeners {
            handle.shutdown();
        }
        self.state.send_replace(DrainState::Closed);
    }
}

struct DrainTask {
    state: watch::Sender<DrainState>,
    trigger: Arc<Notify>,
    listeners: Vec<Handle>,
    timeout: Duration,
    error_handler: Arc<dyn DrainErrorHandler>,
    closed: oneshot::Receiver<Option<DrainError>>,
}

impl DrainTask {
    async fn run(self, mut signals: SignalSubscription) {
        tokio::select! {
            signal = signals.recv() => {
                tracing::info!(signal, "Shutdown signal received, draining existing connections");
            }
            _ = self.trigger.notified() => {
                tracing::info!("Shutdown requested, draining existing connections");
            }
        }
        drop(signals);

        self.state.send_replace(DrainState::Draining);
        let timed_out = drain(&self.listeners, self.timeout).await.err();

        // Listeners have been told to stop; wait for them to report how they closed
        let close_failure = match tokio::time::timeout(self.timeout, self.closed).await {
            Ok(Ok(failure)) => failure,
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!("Listeners did not report their close outcome in time");
                None
            }
        };

        // One report per drain: a timeout outranks a close failure
        match timed_out.or(close_failure) {
            None => {
                tracing::info!("Server was closed successfully with no service interruptions");
            }
            Some(err) => {
                tracing::warn!(error = %err, "Server could not be shut down gracefully");
                self.error_handler.handle(&err);
            }
        }
        self.state.send_replace(DrainState::Closed);
    }
}

/// Stop accepting on every listener and wait up to `timeout` for open
/// connections to finish; close the stragglers if the deadline passes.
async fn drain(listeners: &[Handle], timeout: Duration) -> Result<(), DrainError> {
    for handle in listeners {
        handle.graceful_shutdown(None);
    }

    if tokio::time::timeout(timeout, wait_for_idle(listeners))
        .await
        .is_ok()
    {
        return Ok(());
    }

    let remaining = open_connections(listeners);
    for handle in listeners {
        handle.shutdown();
    }
    Err(DrainError::Timeout { timeout, remaining })
}

async fn wait_for_idle(listeners: &[Handle]) {
    while open_connections(listeners) > 0 {
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

fn open_connections(listeners: &[Handle]) -> usize {
    listeners.iter().map(Handle::connection_count).sum()
}
