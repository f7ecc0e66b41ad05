use super::ValidationError;
use serde::Deserialize;
use std::net::Ipv6Addr;

/// Listener addresses in `host:port` form. An empty host listens on all interfaces.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bind {
    #[serde(default = "default_http")]
    pub http: String,
    #[serde(default = "default_https")]
    pub https: String,
    #[serde(default = "default_metrics")]
    pub metrics: String,
}

fn default_http() -> String {
    ":80".to_string()
}

fn default_https() -> String {
    ":443".to_string()
}

fn default_metrics() -> String {
    ":9090".to_string()
}

impl Default for Bind {
    fn default() -> Self {
        Self {
            http: default_http(),
            https: default_https(),
            metrics: default_metrics(),
        }
    }
}

impl Bind {
    pub fn valid(&self) -> Result<(), ValidationError> {
        let listeners = [
            ("http", &self.http),
            ("https", &self.https),
            ("metrics", &self.metrics),
        ];

        let errs = listeners
            .into_iter()
            .filter_map(|(listener, addr)| {
                split_host_port(addr)
                    .err()
                    .map(|reason| ValidationError::InvalidBindAddress {
                        listener,
                        addr: addr.clone(),
                        reason,
                    })
            })
            .collect();

        ValidationError::join(errs)
    }
}

/// Split `host:port`. The host may be empty or a bracketed IPv6 literal.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), String> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "missing ']' in address".to_string())?;
        host.parse::<Ipv6Addr>()
            .map_err(|e| format!("invalid IPv6 address {host:?}: {e}"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        (host, port)
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        if host.contains(':') {
            return Err("too many colons in address".to_string());
        }
        (host, port)
    };

    if host.chars().any(char::is_whitespace) {
        return Err("host contains whitespace".to_string());
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port {port:?}"))?;

    Ok((host, port))
}

/// Address suitable for `TcpListener::bind`, substituting the wildcard for an empty host.
pub fn listen_address(addr: &str) -> Result<String, String> {
    let (host, port) = split_host_port(addr)?;
    Ok(match host {
        "" => format!("0.0.0.0:{port}"),
        h if h.contains(':') => format!("[{h}]:{port}"),
        h => format!("{h}:{port}"),
    })
}
