//! Built-in certificate manager backed by `rustls-acme`.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use rustls::server::ResolvesServerCert;
use rustls_acme::{AcmeConfig, AcmeState, ResolvesServerCertAcme, UseChallenge};

use super::store::{CertStore, StoreCache, StoreError};
use super::CertManager;

/// Obtains and renews certificates from Let's Encrypt using HTTP-01 challenges.
///
/// The ACME state machine is created at construction but does nothing until
/// `start` spawns it onto the runtime.
pub struct AcmeManager {
    resolver: Arc<ResolvesServerCertAcme>,
    state: Mutex<Option<AcmeState<StoreError, StoreError>>>,
}

impl AcmeManager {
    pub fn new(
        hostnames: &[String],
        store: Arc<dyn CertStore>,
        contacts: &[String],
        production: bool,
    ) -> Self {
        let state = AcmeConfig::new(hostnames)
            .contact(contacts.iter().map(|email| format!("mailto:{}", email)))
            .cache(StoreCache::new(store))
            .directory_lets_encrypt(production)
            .challenge_type(UseChallenge::Http01)
            .state();

        Self {
            resolver: state.resolver(),
            state: Mutex::new(Some(state)),
        }
    }
}

impl CertManager for AcmeManager {
    fn resolver(&self) -> Arc<dyn ResolvesServerCert> {
        self.resolver.clone()
    }

    fn key_authorization(&self, token: &str) -> Option<String> {
        self.resolver.get_http_01_key_auth(token)
    }

    fn start(&self) {
        let state = self.state.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut state) = state else {
            tracing::debug!("ACME event loop already started");
            return;
        };

        // Drives issuance and renewal for the lifetime of the process
        tokio::spawn(async move {
            loop {
                match state.next().await {
                    Some(Ok(event)) => {
                        tracing::info!(event = ?event, "ACME event");
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "ACME error");
                    }
                    None => {
                        tracing::debug!("ACME state stream ended");
                        break;
                    }
                }
            }
        });
    }
}
