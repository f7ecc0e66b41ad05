use super::ValidationError;
use crate::certs::load_certified_key;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Certificate source for a domain: an explicit PEM keypair or the autocert store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tls {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub autocert: bool,
}

impl Tls {
    pub fn valid(&self) -> Result<(), ValidationError> {
        match (self.autocert, &self.cert, &self.key) {
            (true, None, None) => Ok(()),
            (true, _, _) => Err(ValidationError::AutocertWithKeypair),
            (false, Some(cert), Some(key)) => {
                let errs: Vec<_> = [("cert", cert), ("key", key)]
                    .into_iter()
                    .filter_map(|(kind, path)| readable(kind, path).err())
                    .collect();
                if !errs.is_empty() {
                    return ValidationError::join(errs);
                }

                load_certified_key(cert, key)?;
                Ok(())
            }
            (false, _, _) => Err(ValidationError::MissingKeypair),
        }
    }
}

fn readable(kind: &'static str, path: &Path) -> Result<(), ValidationError> {
    std::fs::metadata(path)
        .map(|_| ())
        .map_err(|source| ValidationError::TlsFile {
            kind,
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::write_keypair;
    use super::*;

    #[test]
    fn test_keypair_required() {
        let tls = Tls::default();
        assert!(matches!(tls.valid(), Err(ValidationError::MissingKeypair)));

        let only_cert = Tls {
            cert: Some("/tmp/x.crt".into()),
            ..Default::default()
        };
        assert!(matches!(only_cert.valid(), Err(ValidationError::MissingKeypair)));
    }

    #[test]
    fn test_autocert_excludes_keypair() {
        let auto = Tls {
            autocert: true,
            ..Default::default()
        };
        auto.valid().unwrap();

        let both = Tls {
            cert: Some("/tmp/x.crt".into()),
            key: Some("/tmp/x.key".into()),
            autocert: true,
        };
        assert!(matches!(both.valid(), Err(ValidationError::AutocertWithKeypair)));
    }

    #[test]
    fn test_missing_files_reported_separately() {
        let tls = Tls {
            cert: Some("/nonexistent/a.crt".into()),
            key: Some("/nonexistent/a.key".into()),
            autocert: false,
        };
        let err = tls.valid().unwrap_err();
        assert_eq!(err.leaves().len(), 2);
    }

    #[test]
    fn test_mismatched_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_a, key_a) = write_keypair(dir.path(), "a.example");
        let (_, key_b) = write_keypair(dir.path(), "b.example");

        Tls {
            cert: Some(cert_a.clone()),
            key: Some(key_a),
            autocert: false,
        }
        .valid()
        .unwrap();

        let err = Tls {
            cert: Some(cert_a),
            key: Some(key_b),
            autocert: false,
        }
        .valid()
        .unwrap_err();
        assert!(matches!(err, ValidationError::Keypair(_)));
    }
}
