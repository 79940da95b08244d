//! Certificate provisioning.
//!
//! The `Provisioner` wraps a `CertManager` (by default the ACME-backed
//! `AcmeManager`) with the host allow-list. It hands the TLS listener a
//! per-handshake certificate resolver and the plaintext listener a handler that
//! answers HTTP-01 issuance challenges.

mod challenge;
mod manager;
mod store;

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::config::ResolvedConfig;

pub use challenge::CHALLENGE_PATH_PREFIX;
pub use manager::AcmeManager;
pub use store::{
    account_key, cert_key, CertStore, DirStore, MemoryStore, StoreCache, StoreError,
    MEMORY_STORE_CAPACITY,
};

/// Certificate issuance capability.
///
/// Implementations own the issuance protocol, renewal and retry policy.
pub trait CertManager: Send + Sync {
    /// Resolver consulted by the TLS layer during every handshake.
    fn resolver(&self) -> Arc<dyn ResolvesServerCert>;

    /// Key authorization for a pending HTTP-01 challenge token.
    fn key_authorization(&self, token: &str) -> Option<String>;

    /// Begin background issuance and renewal. Called from within the runtime
    /// when the TLS listener starts; may be called more than once.
    fn start(&self) {}
}

/// Hostnames the server is allowed to present certificates for.
///
/// Matching ignores ASCII case and a trailing dot.
#[derive(Debug, Clone)]
pub struct HostAllowList {
    hosts: Arc<HashSet<String>>,
}

impl HostAllowList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: Arc::new(hosts.into_iter().map(|h| normalize_host(h.as_ref())).collect()),
        }
    }

    pub fn permits(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_host(host))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Refuses handshakes whose SNI is absent or outside the allow-list, and
/// delegates the rest to the certificate manager's resolver.
#[derive(Debug)]
pub struct AllowListResolver {
    allow_list: HostAllowList,
    inner: Arc<dyn ResolvesServerCert>,
}

impl AllowListResolver {
    pub fn new(allow_list: HostAllowList, inner: Arc<dyn ResolvesServerCert>) -> Self {
        Self { allow_list, inner }
    }
}

impl ResolvesServerCert for AllowListResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) if self.allow_list.permits(name) => {}
            Some(name) => {
                tracing::debug!(server_name = %name, "Refusing TLS handshake for host outside allow-list");
                return None;
            }
            None => {
                tracing::debug!("Refusing TLS handshake without SNI");
                return None;
            }
        }
        self.inner.resolve(client_hello)
    }
}

/// Wiring between the listeners and the certificate manager.
#[derive(Clone)]
pub struct Provisioner {
    allow_list: HostAllowList,
    manager: Arc<dyn CertManager>,
}

impl Provisioner {
    pub fn new(allow_list: HostAllowList, manager: Arc<dyn CertManager>) -> Self {
        Self {
            allow_list,
            manager,
        }
    }

    /// Use the configured manager, or build an `AcmeManager` for the resolved
    /// hostnames and store.
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let manager = config.cert_manager.clone().unwrap_or_else(|| {
            Arc::new(AcmeManager::new(
                &config.hostnames,
                config.cert_store.clone(),
                &config.acme_contacts,
                config.acme_production,
            ))
        });
        Self::new(HostAllowList::new(&config.hostnames), manager)
    }

    pub fn allow_list(&self) -> &HostAllowList {
        &self.allow_list
    }

    /// Per-handshake certificate resolver for the TLS listener.
    pub fn cert_resolver(&self) -> Arc<dyn ResolvesServerCert> {
        Arc::new(AllowListResolver::new(
            self.allow_list.clone(),
            self.manager.resolver(),
        ))
    }

    /// Wrap `handler` so issuance-challenge requests are answered here and every
    /// other request reaches `handler` unchanged.
    pub fn http_handler(&self, handler: Router) -> Router {
        challenge::wrap(self.clone(), handler)
    }

    pub fn key_authorization(&self, token: &str) -> Option<String> {
        self.manager.key_authorization(token)
    }

    pub fn start(&self) {
        self.manager.start();
    }
}
