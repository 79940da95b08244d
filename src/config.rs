//! Configuration resolution and constants.
//!
//! `ServerConfig` is the caller-facing input. `ServerConfig::resolve` validates the
//! required fields, applies defaults for ports, timeouts and strategies, and produces
//! a `ResolvedConfig` whose addresses are already in bindable form. `FileConfig` is the
//! TOML representation used by the binary.

use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde::Deserialize;

use crate::acme::{CertManager, CertStore, DirStore};
use crate::error::DrainError;

// =============================================================================
// Defaults
// =============================================================================

/// Plaintext listener address when none is configured
pub const DEFAULT_HTTP_PORT: &str = ":80";

/// TLS listener address when none is configured
pub const DEFAULT_HTTPS_PORT: &str = ":443";

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(25);

/// Upper bound on connection draining after a shutdown signal
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory used by the fallback certificate store
pub const DEFAULT_CACHE_DIR: &str = ".";

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "secure_server=info,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

// =============================================================================
// Strategies
// =============================================================================

/// Decides whether the TLS listener is started at all.
///
/// Evaluated exactly once per `listen_and_serve` call. Closures of type
/// `Fn() -> bool` implement this trait.
pub trait TlsPolicy: Send + Sync {
    fn serve_tls(&self) -> bool;
}

impl<F> TlsPolicy for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn serve_tls(&self) -> bool {
        self()
    }
}

/// Default policy: always serve TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysTls;

impl TlsPolicy for AlwaysTls {
    fn serve_tls(&self) -> bool {
        true
    }
}

/// Receives the error when a graceful drain cannot complete in time.
pub trait DrainErrorHandler: Send + Sync {
    fn handle(&self, error: &DrainError);
}

impl<F> DrainErrorHandler for F
where
    F: Fn(&DrainError) + Send + Sync,
{
    fn handle(&self, error: &DrainError) {
        self(error)
    }
}

/// Default drain handler: does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDrainHandler;

impl DrainErrorHandler for NoopDrainHandler {
    fn handle(&self, _error: &DrainError) {}
}

// =============================================================================
// Input configuration
// =============================================================================

/// Configuration for a `SecureServer`.
///
/// Only `hostnames` and `handler` are required. Empty strings and zero durations
/// mean "use the default".
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Hostnames the server may obtain and present certificates for. TLS
    /// handshakes for any other name are refused.
    pub hostnames: Vec<String>,
    /// Application handler, served on both listeners.
    pub handler: Option<Router>,
    /// Whether to serve TLS. Defaults to always.
    pub tls_policy: Option<Arc<dyn TlsPolicy>>,
    /// Where certificates and ACME account keys persist. Defaults to a
    /// directory store in the working directory; providing one is strongly
    /// recommended.
    pub cert_store: Option<Arc<dyn CertStore>>,
    /// Replaces the built-in ACME certificate manager.
    pub cert_manager: Option<Arc<dyn CertManager>>,
    /// Default ":443"
    pub https_port: String,
    /// Default ":80"
    pub http_port: String,
    /// Default 5 seconds
    pub read_timeout: Duration,
    /// Default 5 seconds
    pub write_timeout: Duration,
    /// Default 25 seconds
    pub idle_timeout: Duration,
    /// Default 5 seconds
    pub drain_timeout: Duration,
    /// Called when draining exceeds `drain_timeout`. Defaults to a no-op.
    pub drain_error_handler: Option<Arc<dyn DrainErrorHandler>>,
    /// ACME account contact addresses, without the `mailto:` scheme.
    pub acme_contacts: Vec<String>,
    /// Use the Let's Encrypt production directory instead of staging.
    pub acme_production: bool,
}

/// Normalized listener address of the form `:<port>`, bound on all interfaces.
///
/// A port of 0 asks the OS for an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddr {
    port: u16,
}

impl ListenAddr {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Dual-stack wildcard address for this port.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.port))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.port)
    }
}

/// Fully defaulted configuration.
#[derive(Clone)]
pub struct ResolvedConfig {
    pub hostnames: Vec<String>,
    pub handler: Router,
    pub tls_policy: Arc<dyn TlsPolicy>,
    pub cert_store: Arc<dyn CertStore>,
    pub cert_manager: Option<Arc<dyn CertManager>>,
    pub https_addr: ListenAddr,
    pub http_addr: ListenAddr,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub drain_error_handler: Arc<dyn DrainErrorHandler>,
    pub acme_contacts: Vec<String>,
    pub acme_production: bool,
}

impl ServerConfig {
    /// Validate required fields and apply defaults.
    ///
    /// Performs no I/O. Once hostnames, handler and ports have been validated no
    /// further step can fail.
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        if self.hostnames.is_empty() {
            return Err(ConfigError::NoHostname);
        }
        let handler = self.handler.ok_or(ConfigError::NoHandler)?;

        let cert_store = self
            .cert_store
            .unwrap_or_else(|| Arc::new(DirStore::new(DEFAULT_CACHE_DIR)));

        let https_addr = resolve_port(&self.https_port, DEFAULT_HTTPS_PORT)?;
        let http_addr = resolve_port(&self.http_port, DEFAULT_HTTP_PORT)?;

        Ok(ResolvedConfig {
            hostnames: self.hostnames,
            handler,
            tls_policy: self.tls_policy.unwrap_or_else(|| Arc::new(AlwaysTls)),
            cert_store,
            cert_manager: self.cert_manager,
            https_addr,
            http_addr,
            read_timeout: or_default(self.read_timeout, DEFAULT_READ_TIMEOUT),
            write_timeout: or_default(self.write_timeout, DEFAULT_WRITE_TIMEOUT),
            idle_timeout: or_default(self.idle_timeout, DEFAULT_IDLE_TIMEOUT),
            drain_timeout: or_default(self.drain_timeout, DEFAULT_DRAIN_TIMEOUT),
            drain_error_handler: self
                .drain_error_handler
                .unwrap_or_else(|| Arc::new(NoopDrainHandler)),
            acme_contacts: self.acme_contacts,
            acme_production: self.acme_production,
        })
    }
}

/// Validate a port string, then normalize it. Accepts `"443"` and `":443"` alike.
fn resolve_port(raw: &str, default: &str) -> Result<ListenAddr, ConfigError> {
    let raw = if raw.is_empty() { default } else { raw };
    let digits = raw.strip_prefix(':').unwrap_or(raw);
    let port = digits
        .parse::<u16>()
        .map_err(|_| ConfigError::NotAnInteger(raw.to_string()))?;
    Ok(ListenAddr::new(port))
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

// =============================================================================
// File configuration (binary)
// =============================================================================

/// TOML configuration read by the `secure-server` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub http_port: String,
    #[serde(default)]
    pub https_port: String,
    /// Set to false to serve plaintext only (local development)
    #[serde(default = "FileConfig::default_tls")]
    pub tls: bool,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub acme: AcmeFileConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timeouts in whole seconds. Zero or absent means the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default)]
    pub read_seconds: u64,
    #[serde(default)]
    pub write_seconds: u64,
    #[serde(default)]
    pub idle_seconds: u64,
    #[serde(default)]
    pub drain_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeFileConfig {
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub production: bool,
    #[serde(default = "AcmeFileConfig::default_cache_dir")]
    pub cache_dir: String,
}

impl Default for AcmeFileConfig {
    fn default() -> Self {
        Self {
            contacts: Vec::new(),
            production: false,
            cache_dir: Self::default_cache_dir(),
        }
    }
}

impl AcmeFileConfig {
    fn default_cache_dir() -> String {
        DEFAULT_CACHE_DIR.to_string()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            hostnames: Vec::new(),
            http_port: String::new(),
            https_port: String::new(),
            tls: Self::default_tls(),
            timeouts: TimeoutsConfig::default(),
            acme: AcmeFileConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl FileConfig {
    fn default_tls() -> bool {
        true
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(contents)?;

        if !matches!(config.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Validation(format!(
                "logging.format must be \"text\" or \"json\", got \"{}\"",
                config.logging.format
            )));
        }

        Ok(config)
    }

    /// Build the library configuration, serving `handler`.
    pub fn into_server_config(self, handler: Router) -> ServerConfig {
        let tls = self.tls;
        ServerConfig {
            hostnames: self.hostnames,
            handler: Some(handler),
            tls_policy: Some(Arc::new(move || tls)),
            cert_store: Some(Arc::new(DirStore::new(self.acme.cache_dir))),
            cert_manager: None,
            https_port: self.https_port,
            http_port: self.http_port,
            read_timeout: Duration::from_secs(self.timeouts.read_seconds),
            write_timeout: Duration::from_secs(self.timeouts.write_seconds),
            idle_timeout: Duration::from_secs(self.timeouts.idle_seconds),
            drain_timeout: Duration::from_secs(self.timeouts.drain_seconds),
            drain_error_handler: None,
            acme_contacts: self.acme.contacts,
            acme_production: self.acme.production,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no hostnames provided")]
    NoHostname,
    #[error("server handler cannot be missing")]
    NoHandler,
    #[error("port number must be a numerical string, got \"{0}\"")]
    NotAnInteger(String),
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn minimal() -> ServerConfig {
        ServerConfig {
            hostnames: vec!["yourdomain.io".to_string()],
            handler: Some(Router::new()),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_hostnames() {
        let config = ServerConfig {
            handler: Some(Router::new()),
            ..Default::default()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::NoHostname)));
    }

    #[test]
    fn test_hostnames_checked_before_handler() {
        let config = ServerConfig::default();
        assert!(matches!(config.resolve(), Err(ConfigError::NoHostname)));
    }

    #[test]
    fn test_missing_handler() {
        let config = ServerConfig {
            hostnames: vec!["yourdomain.io".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::NoHandler)));
    }

    #[test]
    fn test_defaults_applied() {
        let resolved = minimal().resolve().unwrap();

        assert_eq!(resolved.http_addr.to_string(), ":80");
        assert_eq!(resolved.https_addr.to_string(), ":443");
        assert_eq!(resolved.read_timeout, Duration::from_secs(5));
        assert_eq!(resolved.write_timeout, Duration::from_secs(5));
        assert_eq!(resolved.idle_timeout, Duration::from_secs(25));
        assert_eq!(resolved.drain_timeout, Duration::from_secs(5));
        assert!(resolved.tls_policy.serve_tls());
        assert!(resolved.cert_manager.is_none());
        assert!(!resolved.acme_production);

        resolved
            .drain_error_handler
            .handle(&DrainError::Timeout {
                timeout: Duration::from_secs(5),
                remaining: 3,
            });
    }

    #[test]
    fn test_timeouts_default_independently() {
        let config = ServerConfig {
            write_timeout: Duration::from_secs(9),
            drain_timeout: Duration::from_millis(250),
            ..minimal()
        };
        let resolved = config.resolve().unwrap();

        assert_eq!(resolved.read_timeout, DEFAULT_READ_TIMEOUT);
        assert_eq!(resolved.write_timeout, Duration::from_secs(9));
        assert_eq!(resolved.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(resolved.drain_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_port_address_correction() {
        let bare = ServerConfig {
            http_port: "80".to_string(),
            https_port: "443".to_string(),
            ..minimal()
        }
        .resolve()
        .unwrap();
        let prefixed = ServerConfig {
            http_port: ":80".to_string(),
            https_port: ":443".to_string(),
            ..minimal()
        }
        .resolve()
        .unwrap();

        assert_eq!(bare.http_addr.to_string(), ":80");
        assert_eq!(bare.https_addr.to_string(), ":443");
        assert_eq!(bare.http_addr, prefixed.http_addr);
        assert_eq!(bare.https_addr, prefixed.https_addr);
        assert_eq!(
            bare.http_addr.socket_addr(),
            "[::]:80".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_port_zero_is_ephemeral() {
        let resolved = ServerConfig {
            http_port: "0".to_string(),
            https_port: ":0".to_string(),
            ..minimal()
        }
        .resolve()
        .unwrap();

        assert_eq!(resolved.http_addr.port(), 0);
        assert_eq!(resolved.https_addr.to_string(), ":0");
    }

    #[test]
    fn test_http_port_not_an_integer() {
        let config = ServerConfig {
            http_port: "not an int".to_string(),
            ..minimal()
        };
        match config.resolve() {
            Err(ConfigError::NotAnInteger(port)) => assert_eq!(port, "not an int"),
            other => panic!("expected NotAnInteger, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_https_port_not_an_integer() {
        let config = ServerConfig {
            https_port: "not an int".to_string(),
            ..minimal()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::NotAnInteger(_))));
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let config = ServerConfig {
            http_port: ":70000".to_string(),
            ..minimal()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::NotAnInteger(_))));
    }

    #[test]
    fn test_only_one_separator_stripped() {
        let config = ServerConfig {
            http_port: "::80".to_string(),
            ..minimal()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::NotAnInteger(_))));
    }

    #[test]
    fn test_resolution_is_repeatable() {
        let config = ServerConfig {
            http_port: "8080".to_string(),
            idle_timeout: Duration::from_secs(60),
            ..minimal()
        };
        let first = config.clone().resolve().unwrap();
        let second = config.resolve().unwrap();

        assert_eq!(first.hostnames, second.hostnames);
        assert_eq!(first.http_addr, second.http_addr);
        assert_eq!(first.https_addr, second.https_addr);
        assert_eq!(first.read_timeout, second.read_timeout);
        assert_eq!(first.write_timeout, second.write_timeout);
        assert_eq!(first.idle_timeout, second.idle_timeout);
        assert_eq!(first.drain_timeout, second.drain_timeout);
    }

    #[test]
    fn test_supplied_strategies_are_kept() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = ServerConfig {
            tls_policy: Some(Arc::new(|| false)),
            drain_error_handler: Some(Arc::new(move |_: &DrainError| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..minimal()
        };
        let resolved = config.resolve().unwrap();

        assert!(!resolved.tls_policy.serve_tls());
        resolved.drain_error_handler.handle(&DrainError::Timeout {
            timeout: Duration::from_secs(1),
            remaining: 1,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_config_defaults() {
        let config = FileConfig::parse(r#"hostnames = ["example.test"]"#).unwrap();

        assert!(config.tls);
        assert_eq!(config.acme.cache_dir, ".");
        assert_eq!(config.logging.format, "text");

        let resolved = config.into_server_config(Router::new()).resolve().unwrap();
        assert_eq!(resolved.http_addr.to_string(), ":80");
        assert_eq!(resolved.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert!(resolved.tls_policy.serve_tls());
    }

    #[test]
    fn test_file_config_full() {
        let config = FileConfig::parse(
            r#"
            hostnames = ["example.test", "www.example.test"]
            http_port = "8080"
            https_port = ":8443"
            tls = false

            [timeouts]
            read_seconds = 2
            drain_seconds = 10

            [acme]
            contacts = ["admin@example.test"]
            production = true
            cache_dir = "/var/lib/secure-server"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let resolved = config.into_server_config(Router::new()).resolve().unwrap();
        assert_eq!(resolved.hostnames.len(), 2);
        assert_eq!(resolved.http_addr.to_string(), ":8080");
        assert_eq!(resolved.https_addr.to_string(), ":8443");
        assert_eq!(resolved.read_timeout, Duration::from_secs(2));
        assert_eq!(resolved.write_timeout, DEFAULT_WRITE_TIMEOUT);
        assert_eq!(resolved.drain_timeout, Duration::from_secs(10));
        assert!(!resolved.tls_policy.serve_tls());
        assert!(resolved.acme_production);
        assert_eq!(resolved.acme_contacts, vec!["admin@example.test".to_string()]);
    }

    #[test]
    fn test_file_config_rejects_unknown_log_format() {
        let result = FileConfig::parse(
            r#"
            hostnames = ["example.test"]
            [logging]
            format = "xml"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_file_config_requires_hostnames() {
        assert!(matches!(
            FileConfig::parse("http_port = \"80\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
