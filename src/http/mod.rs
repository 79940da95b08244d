//! HTTP server module with TLS support.
//!
//! Runs two listeners side by side:
//! - **HTTPS**: certificates resolved per handshake by the provisioner, for
//!   allow-listed hostnames only
//! - **HTTP**: the application handler, plus ACME HTTP-01 challenge responses
//!   whenever HTTPS is enabled
//!
//! Both are drained together on SIGTERM/SIGINT within the drain timeout.

mod server;
mod shutdown;

pub use server::SecureServer;
pub use shutdown::{CloseReport, DrainState, ShutdownCoordinator, ShutdownTrigger, SignalSubscription};
