//! Certificate storage.
//!
//! `CertStore` is the persistence capability handed to the certificate manager:
//! opaque bytes stored under string keys. `DirStore` keeps one file per key,
//! `MemoryStore` keeps entries in a bounded in-memory cache. `StoreCache` adapts
//! any store to the certificate and account cache traits of `rustls-acme`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use rustls_acme::{AccountCache, CertCache};
use sha2::{Digest, Sha256};

/// Maximum number of entries kept by a `MemoryStore` built with `Default`
pub const MEMORY_STORE_CAPACITY: u64 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid store key: {0:?}")]
    InvalidKey(String),
}

/// Persistent storage for certificate and account material.
///
/// `get` returns `Ok(None)` for a missing key. `delete` of a missing key succeeds.
#[async_trait]
pub trait CertStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Stores each key as a file inside a directory.
///
/// The directory is created on the first `put`, never at construction.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl CertStore for DirStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        // Write then rename so readers never observe a partial entry
        let tmp = self.dir.join(format!(".{}.tmp", key));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// In-memory store. Contents are lost on restart, so certificates are re-issued
/// every time the process starts; intended for tests and short-lived instances.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Cache<String, Arc<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_entries).build(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MEMORY_STORE_CAPACITY)
    }
}

#[async_trait]
impl CertStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .get(key)
            .await
            .map(|data| data.as_ref().clone()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), Arc::new(data.to_vec()))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

/// Exposes a `CertStore` as the certificate and account cache of `rustls-acme`.
#[derive(Clone)]
pub struct StoreCache {
    store: Arc<dyn CertStore>,
}

impl StoreCache {
    pub fn new(store: Arc<dyn CertStore>) -> Self {
        Self { store }
    }
}

/// Key for the certificate covering `domains`, issued by `directory_url`.
pub fn cert_key(domains: &[String], directory_url: &str) -> String {
    format!("cert-{}", digest(domains, directory_url))
}

/// Key for the ACME account registered with `contacts` at `directory_url`.
pub fn account_key(contacts: &[String], directory_url: &str) -> String {
    format!("account-{}", digest(contacts, directory_url))
}

fn digest(names: &[String], directory_url: &str) -> String {
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(directory_url.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

#[async_trait]
impl CertCache for StoreCache {
    type EC = StoreError;

    async fn load_cert(
        &self,
        domains: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(&cert_key(domains, directory_url)).await
    }

    async fn store_cert(
        &self,
        domains: &[String],
        directory_url: &str,
        cert: &[u8],
    ) -> Result<(), StoreError> {
        let key = cert_key(domains, directory_url);
        tracing::info!(key = %key, domains = ?domains, "Storing certificate");
        self.store.put(&key, cert).await
    }
}

#[async_trait]
impl AccountCache for StoreCache {
    type EA = StoreError;

    async fn load_account(
        &self,
        contact: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(&account_key(contact, directory_url)).await
    }

    async fn store_account(
        &self,
        contact: &[String],
        directory_url: &str,
        account: &[u8],
    ) -> Result<(), StoreError> {
        self.store
            .put(&account_key(contact, directory_url), account)
            .await
    }
}
