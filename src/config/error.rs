use super::limits::ByteSizeError;
use super::ssrf::SsrfError;
use crate::certs::KeypairError;
use crate::logging::filter::FilterError;
use std::path::PathBuf;

/// A problem found while validating a decoded configuration.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{}", join_lines(.0))]
    Multiple(Vec<ValidationError>),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<ValidationError>,
    },

    #[error("bind: {listener} address {addr:?} is invalid: {reason}")]
    InvalidBindAddress {
        listener: &'static str,
        addr: String,
        reason: String,
    },

    #[error("name {name:?} is not a valid domain name: {reason}")]
    InvalidDomainName { name: String, reason: String },

    #[error("domain {0:?} is configured more than once")]
    DuplicateDomain(String),

    #[error("{field} has invalid URL {url:?}: {reason}")]
    InvalidUrl {
        field: &'static str,
        url: String,
        reason: String,
    },

    #[error("{field} URL {url:?} has scheme {scheme:?}, want one of http, https, h2c, unix")]
    InvalidScheme {
        field: &'static str,
        url: String,
        scheme: String,
    },

    #[error("{field} unix socket path contains path traversal: {path}")]
    UnixPathTraversal { field: &'static str, path: String },

    #[error("{field} unix socket path is empty")]
    EmptyUnixPath { field: &'static str },

    #[error("{field} failed SSRF validation for {url:?}: {source}")]
    Ssrf {
        field: &'static str,
        url: String,
        source: SsrfError,
    },

    #[error("insecure_skip_verify requires an https target, got scheme {0:?}")]
    InsecureSkipVerifyScheme(String),

    #[error("tls: cert and key are both required unless autocert is enabled")]
    MissingKeypair,

    #[error("tls: autocert can't be combined with an explicit cert or key")]
    AutocertWithKeypair,

    #[error("tls: can't use {kind} file {path}: {source}")]
    TlsFile {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("tls: invalid keypair: {0}")]
    Keypair(#[from] KeypairError),

    #[error("domain {0} uses tls.autocert but no [autocert] section is configured")]
    AutocertNotConfigured(String),

    #[error("autocert: {0}")]
    InvalidAutocert(String),

    #[error("limits: {field} {value:?} is invalid: {source}")]
    InvalidSize {
        field: &'static str,
        value: String,
        source: ByteSizeError,
    },

    #[error("limits: max_header_count must not be negative, got {0}")]
    NegativeHeaderCount(i64),

    #[error("logging: wrong value: {0}")]
    WrongValue(String),

    #[error("logging: filter does not compile: {name} compile({expression:?}): {source}")]
    FilterDoesntCompile {
        name: String,
        expression: String,
        source: FilterError,
    },

    #[error("invalid timeout duration for {field} {value:?}: {reason}")]
    InvalidTimeout {
        field: &'static str,
        value: String,
        reason: String,
    },
}

fn join_lines(errs: &[ValidationError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ValidationError {
    /// Collapse a list of errors: none is success, one is returned as is.
    pub fn join(mut errs: Vec<ValidationError>) -> Result<(), ValidationError> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(ValidationError::Multiple(errs)),
        }
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        ValidationError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Every non-aggregate error in the tree, depth first.
    pub fn leaves(&self) -> Vec<&ValidationError> {
        match self {
            ValidationError::Multiple(errs) => errs.iter().flat_map(|e| e.leaves()).collect(),
            ValidationError::Context { source, .. } => source.leaves(),
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert!(ValidationError::join(vec![]).is_ok());

        let single = ValidationError::join(vec![ValidationError::MissingKeypair]).unwrap_err();
        assert!(matches!(single, ValidationError::MissingKeypair));

        let many = ValidationError::join(vec![
            ValidationError::MissingKeypair,
            ValidationError::NegativeHeaderCount(-1),
        ])
        .unwrap_err();
        assert_eq!(many.leaves().len(), 2);
        assert_eq!(many.to_string().lines().count(), 2);
    }

    #[test]
    fn test_context_prefixes_message() {
        let err = ValidationError::MissingKeypair.context("domain a.example");
        assert!(err.to_string().starts_with("domain a.example: tls:"));
        assert!(matches!(err.leaves()[..], [ValidationError::MissingKeypair]));
    }
}
