//! HTTP/HTTPS listener orchestration.
//!
//! `SecureServer::listen_and_serve` arms the shutdown coordinator, starts the
//! HTTPS listener on its own task when the TLS policy allows it, and then
//! serves plain HTTP on the calling task until shutdown. Each listener gets its
//! own immutable `ListenerSpec`, so the two never share mutable state.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::IntoMakeService;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;

use crate::acme::Provisioner;
use crate::config::{ConfigError, ListenAddr, ResolvedConfig, ServerConfig};
use crate::error::{DrainError, ServerError};
use crate::middleware::request_id_layer;

use super::shutdown::{DrainState, ShutdownCoordinator, ShutdownTrigger};

/// A validated server, ready to serve HTTP and HTTPS.
///
/// `listen_and_serve` may be called once.
pub struct SecureServer {
    config: ResolvedConfig,
    provisioner: Provisioner,
    http_handle: Handle,
    https_handle: Handle,
    coordinator: ShutdownCoordinator,
    tls_enabled: OnceLock<bool>,
}

impl SecureServer {
    /// Resolve `config` and build the certificate provisioner. Opens no sockets.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let config = config.resolve()?;
        let provisioner = Provisioner::from_config(&config);

        let http_handle = Handle::new();
        let https_handle = Handle::new();
        let coordinator = ShutdownCoordinator::new(
            vec![https_handle.clone(), http_handle.clone()],
            config.drain_timeout,
            config.drain_error_handler.clone(),
        );

        Ok(Self {
            config,
            provisioner,
            http_handle,
            https_handle,
            coordinator,
            tls_enabled: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn http_addr(&self) -> ListenAddr {
        self.config.http_addr
    }

    pub fn https_addr(&self) -> ListenAddr {
        self.config.https_addr
    }

    pub fn state(&self) -> DrainState {
        self.coordinator.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.coordinator.subscribe()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.coordinator.trigger()
    }

    /// Outcome of the TLS policy, once `listen_and_serve` has evaluated it.
    pub fn tls_enabled(&self) -> Option<bool> {
        self.tls_enabled.get().copied()
    }

    /// Local address of the HTTP listener, once it is accepting.
    pub async fn http_local_addr(&self) -> Option<SocketAddr> {
        self.http_handle.listening().await
    }

    /// Local address of the HTTPS listener, once it is accepting. `None` when
    /// TLS is disabled.
    pub async fn https_local_addr(&self) -> Option<SocketAddr> {
        if self.tls_enabled() == Some(false) {
            return None;
        }
        self.https_handle.listening().await
    }

    /// Serve until a shutdown signal (or trigger) has drained both listeners.
    ///
    /// Returns an error if a listener cannot bind or fails outside of a
    /// coordinated shutdown; the caller is expected to treat that as fatal.
    /// A listener that fails while closing is reported to the drain error
    /// handler instead.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        let (coordinator, report) = self.coordinator.arm()?;

        match self.serve_listeners().await {
            Ok(close_failure) => {
                report.send(close_failure);
                coordinator
                    .await
                    .map_err(|e| ServerError::Task(e.to_string()))
            }
            Err(err) => {
                coordinator.abort();
                self.coordinator.abandon();
                tracing::error!(error = %err, "Server stopped");
                Err(err)
            }
        }
    }

    /// Runs both listeners to completion. `Ok` carries the first error a
    /// listener returned while closing, if any.
    async fn serve_listeners(&self) -> Result<Option<DrainError>, ServerError> {
        let serve_tls = self.config.tls_policy.serve_tls();
        let _ = self.tls_enabled.set(serve_tls);

        let (http_router, tls_task) = if serve_tls {
            let task = self.spawn_https()?;
            // Let ACME validate domain ownership over plain HTTP
            let router = self.provisioner.http_handler(self.config.handler.clone());
            (router, Some(task))
        } else {
            tracing::warn!(
                "TLS disabled - serving plain HTTP only, ACME challenges will not be answered"
            );
            (self.config.handler.clone(), None)
        };

        let spec = ListenerSpec::new("http", self.config.http_addr, http_router, &self.config);
        let served = self.serve_http(spec).await;
        if served.is_err() {
            self.https_handle.shutdown();
        }

        let tls_result = match tls_task {
            Some(task) => task
                .await
                .unwrap_or_else(|e| Err(ServerError::Task(e.to_string()))),
            None => Ok(None),
        };
        let http_failure = served?;
        let tls_failure = tls_result?;
        Ok(http_failure.or(tls_failure))
    }

    async fn serve_http(&self, spec: ListenerSpec) -> Result<Option<DrainError>, ServerError> {
        let listener = spec.bind()?;
        tracing::info!(addr = %spec.listen_addr, "Serving HTTP");

        let mut server = axum_server::from_tcp(listener).handle(self.http_handle.clone());
        spec.configure(server.http_builder());
        let result = server.serve(spec.app()).await;

        closed_or_fatal(self.coordinator.state(), spec.socket_addr(), result)
    }

    fn spawn_https(&self) -> Result<JoinHandle<Result<Option<DrainError>, ServerError>>, ServerError> {
        let spec = ListenerSpec::new(
            "https",
            self.config.https_addr,
            self.config.handler.clone(),
            &self.config,
        );
        let tls_config = self.tls_config()?;
        let listener = spec.bind()?;

        self.provisioner.start();
        tracing::info!(
            addr = %spec.listen_addr,
            hosts = ?self.config.hostnames,
            "Serving HTTPS"
        );

        let handle = self.https_handle.clone();
        let http_handle = self.http_handle.clone();
        let state = self.coordinator.subscribe();

        Ok(tokio::spawn(async move {
            let mut server = axum_server::from_tcp_rustls(listener, tls_config).handle(handle);
            spec.configure(server.http_builder());
            let result = server.serve(spec.app()).await;

            let state = *state.borrow();
            let result = closed_or_fatal(state, spec.socket_addr(), result);
            if let Err(err) = &result {
                tracing::error!(error = %err, "HTTPS listener failed, stopping HTTP listener");
                http_handle.shutdown();
            }
            result
        }))
    }

    fn tls_config(&self) -> Result<RustlsConfig, ServerError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(self.provisioner.cert_resolver());
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(RustlsConfig::from_config(Arc::new(config)))
    }
}

/// Listener exits after the coordinator has begun draining are closes; an
/// error at that point is a close failure for the drain handler. Anything
/// else is fatal.
fn closed_or_fatal(
    state: DrainState,
    addr: SocketAddr,
    result: io::Result<()>,
) -> Result<Option<DrainError>, ServerError> {
    match result {
        Ok(()) => Ok(None),
        Err(source) if state.is_shutting_down() => {
            tracing::debug!(%addr, error = %source, "Listener failed while closing");
            Ok(Some(DrainError::Listener { addr, source }))
        }
        Err(source) => Err(ServerError::Serve { addr, source }),
    }
}

/// Everything one listener needs, captured once at startup.
struct ListenerSpec {
    name: &'static str,
    listen_addr: ListenAddr,
    router: Router,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
}

impl ListenerSpec {
    fn new(
        name: &'static str,
        listen_addr: ListenAddr,
        router: Router,
        config: &ResolvedConfig,
    ) -> Self {
        Self {
            name,
            listen_addr,
            router,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            idle_timeout: config.idle_timeout,
        }
    }

    fn socket_addr(&self) -> SocketAddr {
        self.listen_addr.socket_addr()
    }

    /// Bind dual-stack on `[::]`, or on `0.0.0.0` when the host has no IPv6.
    fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.socket_addr();
        let listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(err) if !ipv6_unavailable(&err) => {
                return Err(ServerError::Bind { addr, source: err });
            }
            Err(err) => {
                let fallback = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
                tracing::debug!(%addr, %fallback, error = %err, "IPv6 unavailable, binding IPv4 only");
                TcpListener::bind(fallback).map_err(|source| ServerError::Bind {
                    addr: fallback,
                    source,
                })?
            }
        };
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(listener)
    }

    fn configure(&self, builder: &mut Builder<TokioExecutor>) {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.read_timeout);
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(self.idle_timeout)
            .keep_alive_timeout(self.read_timeout);
    }

    fn app(&self) -> IntoMakeService<Router> {
        self.router
            .clone()
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.write_timeout,
            ))
            .layer(middleware::from_fn_with_state(self.name, request_id_layer))
            .into_make_service()
    }
}

/// Errors from binding `[::]` that mean IPv6 is missing rather than that the
/// port is taken.
fn ipv6_unavailable(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}
