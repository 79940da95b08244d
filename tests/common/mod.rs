//! Shared harness for the listener integration tests.
//!
//! Servers bind ephemeral ports on all interfaces and are reached through
//! loopback. A `StaticCertManager` stands in for ACME: it presents one
//! self-signed certificate and a fixed set of HTTP-01 tokens.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::task::JoinHandle;

use secure_server::{CertManager, MemoryStore, SecureServer, ServerConfig, ServerError};

pub const HOST: &str = "example.test";
pub const OTHER_HOST: &str = "other.test";
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct FixedResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

pub struct StaticCertManager {
    resolver: Arc<FixedResolver>,
    tokens: HashMap<String, String>,
    started: AtomicBool,
    pub certificate: CertificateDer<'static>,
}

impl StaticCertManager {
    /// Self-signed certificate valid for both `HOST` and `OTHER_HOST`, so a
    /// refused handshake can only come from the allow-list.
    pub fn new(tokens: &[(&str, &str)]) -> Arc<Self> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![HOST.to_string(), OTHER_HOST.to_string()])
                .unwrap();
        let certificate = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key).unwrap();

        Arc::new(Self {
            resolver: Arc::new(FixedResolver(Arc::new(CertifiedKey::new(
                vec![certificate.clone()],
                signing_key,
            )))),
            tokens: tokens
                .iter()
                .map(|(token, auth)| (token.to_string(), auth.to_string()))
                .collect(),
            started: AtomicBool::new(false),
            certificate,
        })
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl CertManager for StaticCertManager {
    fn resolver(&self) -> Arc<dyn ResolvesServerCert> {
        self.resolver.clone()
    }

    fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }
}

/// Configuration on ephemeral ports with an in-memory store.
pub fn config(handler: Router, manager: &Arc<StaticCertManager>) -> ServerConfig {
    ServerConfig {
        hostnames: vec![HOST.to_string()],
        handler: Some(handler),
        cert_manager: Some(manager.clone()),
        cert_store: Some(Arc::new(MemoryStore::default())),
        http_port: "0".to_string(),
        https_port: ":0".to_string(),
        ..Default::default()
    }
}

pub struct Running {
    pub server: Arc<SecureServer>,
    pub task: JoinHandle<Result<(), ServerError>>,
    pub http: SocketAddr,
    pub https: Option<SocketAddr>,
}

impl Running {
    pub async fn start(config: ServerConfig) -> Self {
        let server = Arc::new(SecureServer::new(config).unwrap());
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.listen_and_serve().await }
        });

        let http = tokio::time::timeout(STARTUP_TIMEOUT, server.http_local_addr())
            .await
            .expect("HTTP listener did not start")
            .expect("HTTP listener has no address");
        let https = match server.tls_enabled() {
            Some(true) => Some(
                tokio::time::timeout(STARTUP_TIMEOUT, server.https_local_addr())
                    .await
                    .expect("HTTPS listener did not start")
                    .expect("HTTPS listener has no address"),
            ),
            _ => None,
        };

        Self {
            server,
            task,
            http: loopback(http),
            https: https.map(loopback),
        }
    }

    /// Wait for `listen_and_serve` to return.
    pub async fn finished(self, within: Duration) -> Result<(), ServerError> {
        tokio::time::timeout(within, self.task)
            .await
            .expect("server did not shut down in time")
            .expect("server task panicked")
    }
}

pub fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
}

/// Plain HTTP client sending requests for `host` to `addr`.
pub fn http_client(host: &str, addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve(host, addr)
        .build()
        .unwrap()
}

/// HTTPS client trusting `certificate`, sending both test hostnames to `addr`.
pub fn https_client(certificate: &CertificateDer<'static>, addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(reqwest::Certificate::from_der(certificate.as_ref()).unwrap())
        .resolve(HOST, addr)
        .resolve(OTHER_HOST, addr)
        .build()
        .unwrap()
}

pub fn url(scheme: &str, host: &str, addr: SocketAddr, path: &str) -> String {
    format!("{}://{}:{}{}", scheme, host, addr.port(), path)
}

/// Complete a TLS handshake for `HOST` against `addr`, trusting `certificate`.
/// With `send_sni` false the ClientHello carries no server name.
pub fn tls_handshake(
    certificate: &CertificateDer<'static>,
    addr: SocketAddr,
    send_sni: bool,
) -> io::Result<()> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(certificate.clone()).unwrap();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.enable_sni = send_sni;

    let name = ServerName::try_from(HOST).unwrap();
    let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
    let mut socket = TcpStream::connect(addr)?;
    socket.set_read_timeout(Some(STARTUP_TIMEOUT))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut socket)?;
    }
    Ok(())
}
