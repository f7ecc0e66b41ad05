use super::ValidationError;
use serde::Deserialize;
use std::path::{Component, PathBuf};

/// Certificates issued by an external ACME client into `cache_dir`.
///
/// Layout: `<cache_dir>/<domain>/cert.pem`, `<cache_dir>/<domain>/key.pem`,
/// and HTTP-01 key authorizations at `<cache_dir>/http-01/<token>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Autocert {
    pub cache_dir: PathBuf,

    /// Status used to redirect plain HTTP requests for autocert domains
    #[serde(default = "default_redirect_code")]
    pub http_redirect_code: u16,
}

fn default_redirect_code() -> u16 {
    301
}

impl Autocert {
    pub fn valid(&self) -> Result<(), ValidationError> {
        let mut errs = Vec::new();

        if self.cache_dir.as_os_str().is_empty() {
            errs.push(ValidationError::InvalidAutocert(
                "cache_dir must not be empty".to_string(),
            ));
        }
        if self
            .cache_dir
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            errs.push(ValidationError::InvalidAutocert(format!(
                "cache_dir {} contains path traversal",
                self.cache_dir.display()
            )));
        }
        if ![301, 302, 303, 307, 308].contains(&self.http_redirect_code) {
            errs.push(ValidationError::InvalidAutocert(format!(
                "http_redirect_code must be a redirect status, got {}",
                self.http_redirect_code
            )));
        }

        ValidationError::join(errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let autocert: Autocert = toml::from_str(r#"cache_dir = "/var/lib/hostgate""#).unwrap();
        assert_eq!(autocert.http_redirect_code, 301);
        autocert.valid().unwrap();
    }

    #[test]
    fn test_invalid() {
        let autocert = Autocert {
            cache_dir: PathBuf::from("/var/lib/../etc"),
            http_redirect_code: 200,
        };
        assert_eq!(autocert.valid().unwrap_err().leaves().len(), 2);
    }
}
