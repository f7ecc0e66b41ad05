//! Configuration model for the router.
//!
//! The configuration file is TOML:
//!
//! ```toml
//! [bind]
//! http = ":80"
//! https = ":443"
//! metrics = "127.0.0.1:9090"
//!
//! [logging]
//! access_log = "/var/log/hostgate/access.log"
//!
//! [[domain]]
//! name = "app.example.com"
//! target = "http://10.0.0.5:3000"
//! health_target = "http://10.0.0.5:3000/healthz"
//! allow_private_target = true
//!
//! [domain.tls]
//! cert = "/etc/hostgate/app.example.com.crt"
//! key = "/etc/hostgate/app.example.com.key"
//! ```
//!
//! Every type exposes `valid()`. Parents join the errors of their children so a
//! single pass reports every problem in the file.

mod autocert;
mod bind;
mod domain;
mod error;
mod limits;
mod logging;
pub mod ssrf;
mod tls;

pub use autocert::Autocert;
pub use bind::{listen_address, split_host_port, Bind};
pub use domain::{parse_duration, unix_socket_path, Domain, ResolvedTimeouts, Timeouts};
pub use error::ValidationError;
pub use limits::{
    parse_byte_size, ByteSizeError, Limits, DEFAULT_MAX_HEADER_COUNT, DEFAULT_MAX_HEADER_SIZE,
    DEFAULT_MAX_REQUEST_BODY,
};
pub use logging::{Filter, Logging};
pub use tls::Tls;

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Errors from loading a configuration file.
///
/// Decode failures (the file is not well-formed) are kept apart from
/// validation failures (well-formed but semantically wrong).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("can't decode configuration file {path}:\n\n{source}")]
    Decode {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("configuration file {path} is invalid:\n\n{source}")]
    Invalid {
        path: PathBuf,
        source: ValidationError,
    },
}

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Toplevel {
    #[serde(default)]
    pub bind: Bind,

    #[serde(default, rename = "domain")]
    pub domains: Vec<Domain>,

    #[serde(default)]
    pub logging: Logging,

    /// Certificates provisioned by an external ACME client
    #[serde(default)]
    pub autocert: Option<Autocert>,
}

impl Toplevel {
    /// Read, decode and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Toplevel = toml::from_str(&content).map_err(|source| ConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

        config.valid().map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(config)
    }

    pub fn valid(&self) -> Result<(), ValidationError> {
        let mut errs = Vec::new();

        if let Err(e) = self.bind.valid() {
            errs.push(e);
        }

        let mut seen = HashSet::new();
        for domain in &self.domains {
            if let Err(e) = domain.valid() {
                errs.push(e.context(format!("domain {}", domain.name)));
            }

            if !seen.insert(domain.name.to_ascii_lowercase()) {
                errs.push(ValidationError::DuplicateDomain(domain.name.clone()));
            }

            if domain.tls.autocert && self.autocert.is_none() {
                errs.push(ValidationError::AutocertNotConfigured(domain.name.clone()));
            }
        }

        if let Err(e) = self.logging.valid() {
            errs.push(e);
        }

        if let Some(autocert) = &self.autocert {
            if let Err(e) = autocert.valid() {
                errs.push(e);
            }
        }

        ValidationError::join(errs)
    }

    /// Names of the domains that delegate certificates to the autocert store.
    pub fn autocert_hosts(&self) -> Vec<String> {
        self.domains
            .iter()
            .filter(|d| d.tls.autocert)
            .filter_map(|d| d.ascii_name().ok())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::path::{Path, PathBuf};

    /// Write a self-signed keypair for `name` into `dir`, returning (cert, key) paths.
    pub fn write_keypair(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let cert_path = dir.join(format!("{name}.crt"));
        let key_path = dir.join(format!("{name}.key"));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }
}
