//! Rejects backend targets that point into private address space.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Public,
    Private,
}

#[derive(Debug, thiserror::Error)]
pub enum SsrfError {
    #[error("can't parse URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("target points to private IP address {0} (SSRF protection)")]
    PrivateTarget(IpAddr),
}

/// Classify an address as private (loopback, link-local, RFC 1918, unique local,
/// shared address space, documentation, multicast, reserved, unspecified) or public.
pub fn classify_address(ip: IpAddr) -> AddressClass {
    let private = match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(v4),
            None => is_private_v6(v6),
        },
    };

    if private {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    ip.is_unspecified()
        || a == 0
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || (a == 100 && (b & 0xc0) == 64)
        || ip.is_documentation()
        || ip.is_multicast()
        || a >= 240
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let second = ip.segments()[1];
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || (first == 0x2001 && second == 0x0db8)
}

/// Literal IP address in the URL's host, if the host is one.
pub fn literal_ip(url: &Url) -> Option<IpAddr> {
    let host = url.host_str()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse().ok()
}

pub(crate) fn check_target(url: &Url, allow_private: bool) -> Result<(), SsrfError> {
    if allow_private || !matches!(url.scheme(), "http" | "https" | "h2c") {
        return Ok(());
    }

    match literal_ip(url) {
        Some(ip) if classify_address(ip) == AddressClass::Private => {
            Err(SsrfError::PrivateTarget(ip))
        }
        _ => Ok(()),
    }
}

/// Validate a backend URL. Hostnames pass; only literal addresses are classified.
pub fn validate_target_for_ssrf(target: &str, allow_private: bool) -> Result<(), SsrfError> {
    let url = Url::parse(target)?;
    check_target(&url, allow_private)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_address() {
        let private = [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "100.64.0.1",
            "100.127.255.255",
            "192.0.2.1",
            "198.51.100.7",
            "203.0.113.9",
            "224.0.0.1",
            "240.0.0.1",
            "255.255.255.255",
            "0.0.0.0",
            "::1",
            "::",
            "fe80::1",
            "fc00::1",
            "fd12:3456::1",
            "ff02::1",
            "2001:db8::1",
            "::ffff:127.0.0.1",
            "::ffff:10.0.0.1",
        ];
        for addr in private {
            let ip: IpAddr = addr.parse().unwrap();
            assert_eq!(classify_address(ip), AddressClass::Private, "{addr}");
        }

        let public = ["8.8.8.8", "1.1.1.1", "100.128.0.1", "172.32.0.1", "2606:4700::1111"];
        for addr in public {
            let ip: IpAddr = addr.parse().unwrap();
            assert_eq!(classify_address(ip), AddressClass::Public, "{addr}");
        }
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target_for_ssrf("http://127.0.0.1:3000", false).is_err());
        assert!(validate_target_for_ssrf("https://[::1]:8443", false).is_err());
        assert!(validate_target_for_ssrf("h2c://10.0.0.5:50051", false).is_err());
        assert!(validate_target_for_ssrf("h2c://[fd00::1]:50051", false).is_err());

        validate_target_for_ssrf("http://127.0.0.1:3000", true).unwrap();
        validate_target_for_ssrf("http://8.8.8.8", false).unwrap();
        validate_target_for_ssrf("http://localhost:3000", false).unwrap();
        validate_target_for_ssrf("unix:///run/app.sock", false).unwrap();

        let err = validate_target_for_ssrf("http://192.168.0.10", false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "target points to private IP address 192.168.0.10 (SSRF protection)"
        );
    }
}
