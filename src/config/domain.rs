use super::ssrf::check_target;
use super::{Limits, Tls, ValidationError};
use serde::Deserialize;
use std::time::Duration;
use url::{Host, Url};

/// One routed hostname.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Domain {
    pub name: String,

    #[serde(default)]
    pub tls: Tls,

    /// Backend URL: `http://`, `https://`, `h2c://` or `unix://<path>`
    pub target: String,

    pub health_target: String,

    /// Skip certificate verification of an https backend
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Permit targets that resolve to loopback, link-local or private ranges
    #[serde(default)]
    pub allow_private_target: bool,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub limits: Limits,
}

impl Domain {
    pub fn valid(&self) -> Result<(), ValidationError> {
        let mut errs = Vec::new();

        if let Err(e) = self.ascii_name() {
            errs.push(e);
        }

        for (field, raw) in [("target", &self.target), ("health_target", &self.health_target)] {
            if let Err(e) = check_url(field, raw, self.allow_private_target) {
                errs.push(e);
            }
        }

        if self.insecure_skip_verify {
            if let Ok(url) = Url::parse(&self.target) {
                if url.scheme() != "https" {
                    errs.push(ValidationError::InsecureSkipVerifyScheme(
                        url.scheme().to_string(),
                    ));
                }
            }
        }

        if let Err(e) = self.tls.valid() {
            errs.push(e);
        }

        if let Err(e) = self.timeouts.resolve() {
            errs.push(e);
        }

        if let Err(e) = self.limits.valid() {
            errs.push(e);
        }

        ValidationError::join(errs)
    }

    /// The lowercase ASCII (punycode) form of the name, used as the routing key.
    pub fn ascii_name(&self) -> Result<String, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidDomainName {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("name is empty".to_string()));
        }

        match Host::parse(&self.name) {
            Ok(Host::Domain(name)) => Ok(name),
            Ok(Host::Ipv4(ip)) => Ok(ip.to_string()),
            Ok(Host::Ipv6(ip)) => Ok(format!("[{ip}]")),
            Err(e) => Err(invalid(e.to_string())),
        }
    }
}

fn check_url(field: &'static str, raw: &str, allow_private: bool) -> Result<(), ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidUrl {
        field,
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" | "h2c" => {
            check_target(&url, allow_private).map_err(|source| ValidationError::Ssrf {
                field,
                url: raw.to_string(),
                source,
            })
        }
        "unix" => {
            let path = unix_socket_path(raw).unwrap_or_default();
            if path.contains("../") {
                Err(ValidationError::UnixPathTraversal {
                    field,
                    path: path.to_string(),
                })
            } else if path.is_empty() {
                Err(ValidationError::EmptyUnixPath { field })
            } else {
                Ok(())
            }
        }
        scheme => Err(ValidationError::InvalidScheme {
            field,
            url: raw.to_string(),
            scheme: scheme.to_string(),
        }),
    }
}

/// Socket path of a `unix://` target: everything after the scheme prefix.
pub fn unix_socket_path(target: &str) -> Option<&str> {
    const PREFIX: &str = "unix://";
    match target.get(..PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(PREFIX) => Some(&target[PREFIX.len()..]),
        _ => None,
    }
}

/// Backend timeouts as written in the configuration, e.g. `dial = "5s"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
    pub dial: Option<String>,
    pub response_header: Option<String>,
    pub idle: Option<String>,
}

/// Parsed timeouts. `None` disables the corresponding timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimeouts {
    pub dial: Option<Duration>,
    pub response_header: Option<Duration>,
    pub idle: Option<Duration>,
}

impl ResolvedTimeouts {
    pub const DEFAULT: Self = Self {
        dial: Some(Duration::from_secs(5)),
        response_header: Some(Duration::from_secs(10)),
        idle: Some(Duration::from_secs(90)),
    };
}

impl Default for ResolvedTimeouts {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Timeouts {
    /// Parse the configured values. When nothing is set the defaults apply;
    /// once any value is set, unset ones mean "no timeout".
    pub fn resolve(&self) -> Result<ResolvedTimeouts, ValidationError> {
        let set = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        let (dial, response_header, idle) =
            (set(&self.dial), set(&self.response_header), set(&self.idle));

        if dial.is_none() && response_header.is_none() && idle.is_none() {
            return Ok(ResolvedTimeouts::DEFAULT);
        }

        let mut errs = Vec::new();
        let mut parse = |field: &'static str, value: Option<String>| -> Option<Duration> {
            let value = value?;
            match parse_duration(&value) {
                Ok(d) if d.is_zero() => None,
                Ok(d) => Some(d),
                Err(reason) => {
                    errs.push(ValidationError::InvalidTimeout {
                        field,
                        value,
                        reason,
                    });
                    None
                }
            }
        };

        let resolved = ResolvedTimeouts {
            dial: parse("dial", dial),
            response_header: parse("response_header", response_header),
            idle: parse("idle", idle),
        };

        ValidationError::join(errs).map(|()| resolved)
    }
}

/// Parse a duration such as `"300ms"` or `"1h30m"`. A bare `"0"` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(input).map_err(|e| format!("invalid duration {input:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str, target: &str) -> Domain {
        Domain {
            name: name.to_string(),
            tls: Tls {
                autocert: true,
                ..Default::default()
            },
            target: target.to_string(),
            health_target: target.to_string(),
            insecure_skip_verify: false,
            allow_private_target: true,
            timeouts: Timeouts::default(),
            limits: Limits::default(),
        }
    }

    #[test]
    fn test_ascii_name() {
        assert_eq!(
            domain("App.Example.COM", "http://10.0.0.1").ascii_name().unwrap(),
            "app.example.com"
        );
        assert_eq!(
            domain("bücher.example", "http://10.0.0.1").ascii_name().unwrap(),
            "xn--bcher-kva.example"
        );
        assert!(domain("", "http://10.0.0.1").ascii_name().is_err());
        assert!(domain("bad name.example", "http://10.0.0.1").ascii_name().is_err());
        assert!(domain("a/b", "http://10.0.0.1").ascii_name().is_err());
    }

    #[test]
    fn test_target_schemes() {
        domain("a.example", "http://10.0.0.1:3000").valid().unwrap();
        domain("a.example", "https://10.0.0.1").valid().unwrap();
        domain("a.example", "h2c://10.0.0.1:50051").valid().unwrap();
        domain("a.example", "unix:///run/app.sock").valid().unwrap();

        let err = domain("a.example", "ftp://10.0.0.1").valid().unwrap_err();
        assert!(matches!(err.leaves()[0], ValidationError::InvalidScheme { .. }));

        let err = domain("a.example", "::not a url").valid().unwrap_err();
        assert!(matches!(err.leaves()[0], ValidationError::InvalidUrl { .. }));
    }

    #[test]
    fn test_unix_paths() {
        assert_eq!(unix_socket_path("unix:///run/app.sock"), Some("/run/app.sock"));
        assert_eq!(unix_socket_path("UNIX://relative.sock"), Some("relative.sock"));
        assert_eq!(unix_socket_path("http://x"), None);

        let err = domain("a.example", "unix:///run/../etc/app.sock")
            .valid()
            .unwrap_err();
        assert!(matches!(
            err.leaves()[0],
            ValidationError::UnixPathTraversal { .. }
        ));

        let err = domain("a.example", "unix://").valid().unwrap_err();
        assert!(err
            .leaves()
            .iter()
            .all(|e| matches!(e, ValidationError::EmptyUnixPath { .. })));
    }

    #[test]
    fn test_private_targets_need_opt_in() {
        let mut d = domain("a.example", "http://127.0.0.1:3000");
        d.valid().unwrap();

        d.allow_private_target = false;
        let err = d.valid().unwrap_err();
        assert!(err.to_string().contains("SSRF protection"));

        d.target = "http://app.internal:3000".to_string();
        d.health_target = "http://app.internal:3000/healthz".to_string();
        d.valid().unwrap();
    }

    #[test]
    fn test_insecure_skip_verify_requires_https() {
        let mut d = domain("a.example", "http://10.0.0.1:3000");
        d.insecure_skip_verify = true;
        let err = d.valid().unwrap_err();
        assert!(matches!(
            err.leaves()[0],
            ValidationError::InsecureSkipVerifyScheme(_)
        ));

        d.target = "https://10.0.0.1".to_string();
        d.valid().unwrap();
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(
            Timeouts::default().resolve().unwrap(),
            ResolvedTimeouts::DEFAULT
        );

        let partial = Timeouts {
            dial: Some("250ms".into()),
            ..Default::default()
        };
        assert_eq!(
            partial.resolve().unwrap(),
            ResolvedTimeouts {
                dial: Some(Duration::from_millis(250)),
                response_header: None,
                idle: None,
            }
        );

        let bad = Timeouts {
            dial: Some("5 parsecs".into()),
            idle: Some("-1s".into()),
            ..Default::default()
        };
        assert_eq!(bad.resolve().unwrap_err().leaves().len(), 2);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5parsecs").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_oversized_timeout_is_a_validation_error() {
        assert!(parse_duration("340282366920938463463374607431768211us").is_err());

        let mut d = domain("a.example", "http://10.0.0.1:3000");
        d.timeouts.idle = Some("99999999999999999999999999h".into());
        let err = d.valid().unwrap_err();
        assert!(matches!(
            err.leaves()[0],
            ValidationError::InvalidTimeout { field: "idle", .. }
        ));
    }
}
