use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Failure while starting or running the listeners.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Listener at {addr} failed: {source}")]
    Serve {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Failed to register shutdown signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("TLS listener task failed: {0}")]
    Task(String),

    #[error("Server has already been started")]
    AlreadyStarted,
}

/// Graceful drain did not complete. Passed to the configured drain handler.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("graceful shutdown timed out after {timeout:?} with {remaining} connection(s) still open")]
    Timeout { timeout: Duration, remaining: usize },

    /// A listener reported an error while it was being closed.
    #[error("listener at {addr} failed while closing: {source}")]
    Listener {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
