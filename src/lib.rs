//! secure-server: serve an axum application over HTTP and HTTPS at once, with
//! certificates obtained on demand through ACME and a bounded graceful drain on
//! shutdown.
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use secure_server::{SecureServer, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SecureServer::new(ServerConfig {
//!     hostnames: vec!["example.com".to_string()],
//!     handler: Some(Router::new().route("/", get(|| async { "hello" }))),
//!     ..Default::default()
//! })?;
//! server.listen_and_serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod acme;
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;

pub use acme::{CertManager, CertStore, DirStore, MemoryStore, Provisioner};
pub use config::{
    AlwaysTls, ConfigError, DrainErrorHandler, ListenAddr, NoopDrainHandler, ResolvedConfig,
    ServerConfig, TlsPolicy,
};
pub use error::{DrainError, ServerError};
pub use http::{DrainState, SecureServer, ShutdownTrigger};
