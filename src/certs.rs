//! Certificate loading: explicit PEM keypairs and the autocert cache directory.

use dashmap::DashMap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum KeypairError {
    #[error("can't open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("can't parse PEM in {path}: {source}")]
    Pem { path: PathBuf, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key: {0}")]
    UnsupportedKey(rustls::Error),

    #[error("private key does not match certificate: {0}")]
    Mismatch(rustls::Error),
}

/// The crypto provider used for every TLS configuration in the process.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// TLS server configuration answering with certificates from `resolver`.
pub fn server_config(resolver: Arc<dyn ResolvesServerCert>) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, KeypairError> {
    let file = File::open(path).map_err(|source| KeypairError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| KeypairError::Pem {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(KeypairError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, KeypairError> {
    let file = File::open(path).map_err(|source| KeypairError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    loop {
        let item = rustls_pemfile::read_one(&mut reader).map_err(|source| KeypairError::Pem {
            path: path.to_path_buf(),
            source,
        })?;
        match item {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => return Err(KeypairError::NoPrivateKey(path.to_path_buf())),
            _ => continue,
        }
    }
}

/// Load a PEM certificate chain and its private key, checking that they belong together.
pub fn load_certified_key(cert: &Path, key: &Path) -> Result<Arc<CertifiedKey>, KeypairError> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(key)
        .map_err(KeypairError::UnsupportedKey)?;

    let certified = CertifiedKey::new(certs, signing_key);
    certified.keys_match().map_err(KeypairError::Mismatch)?;
    Ok(Arc::new(certified))
}

/// Seconds since the epoch at which the leaf certificate stops being valid.
fn not_after(key: &CertifiedKey) -> Option<i64> {
    use x509_parser::prelude::*;

    let leaf = key.end_entity_cert().ok()?;
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).ok()?;
    Some(parsed.validity().not_after.timestamp())
}

fn is_expired(key: &CertifiedKey) -> bool {
    let now = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    not_after(key).is_some_and(|expiry| expiry <= now)
}

#[derive(Debug)]
struct CachedCert {
    modified: SystemTime,
    key: Arc<CertifiedKey>,
}

/// Certificates kept current by an external ACME client.
///
/// Only whitelisted hosts are served; a certificate is re-read when its file
/// modification time changes.
#[derive(Debug)]
pub struct AutocertStore {
    cache_dir: PathBuf,
    hosts: HashSet<String>,
    cache: DashMap<String, CachedCert>,
}

impl AutocertStore {
    pub fn new(cache_dir: impl Into<PathBuf>, hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            hosts: hosts.into_iter().collect(),
            cache: DashMap::new(),
        }
    }

    pub fn manages(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn certificate(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        if !self.manages(host) {
            return None;
        }

        let dir = self.cache_dir.join(host);
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        let modified = std::fs::metadata(&cert_path)
            .and_then(|m| m.modified())
            .map_err(|e| debug!(host, path = %cert_path.display(), error = %e, "no autocert certificate"))
            .ok()?;

        if let Some(cached) = self.cache.get(host) {
            if cached.modified == modified && !is_expired(&cached.key) {
                return Some(cached.key.clone());
            }
        }

        let key = match load_certified_key(&cert_path, &key_path) {
            Ok(key) => key,
            Err(e) => {
                warn!(host, error = %e, "can't load autocert certificate");
                return None;
            }
        };

        if is_expired(&key) {
            warn!(host, path = %cert_path.display(), "autocert certificate has expired");
            self.cache.remove(host);
            return None;
        }

        self.cache.insert(
            host.to_string(),
            CachedCert {
                modified,
                key: key.clone(),
            },
        );
        Some(key)
    }

    /// Key authorization for an HTTP-01 challenge token, if the ACME client published one.
    pub fn http01_key_authorization(&self, token: &str) -> Option<String> {
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return None;
        }

        std::fs::read_to_string(self.cache_dir.join("http-01").join(token))
            .ok()
            .map(|s| s.trim().to_string())
    }
}
