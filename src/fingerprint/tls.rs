//! JA3N and JA4 TLS client fingerprints.

use md5::{Digest as _, Md5};
use sha2::Sha256;
use std::fmt::Write as _;

use super::client_hello::{
    ClientHello, EXT_ALPN, EXT_QUIC_TRANSPORT_PARAMETERS, EXT_SERVER_NAME, EXT_SUPPORTED_VERSIONS,
};

const TLS_1_2: u16 = 0x0303;

pub(crate) fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a
}

fn non_grease(values: &[u16]) -> impl Iterator<Item = u16> + '_ {
    values.iter().copied().filter(|v| !is_grease(*v))
}

/// Fingerprints of one TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFingerprint {
    pub ja3n: String,
    pub ja4: String,
}

impl TlsFingerprint {
    pub fn from_client_hello(hello: &ClientHello) -> Self {
        Self {
            ja3n: ja3n(hello),
            ja4: ja4(hello),
        }
    }
}

fn join_decimal(values: impl Iterator<Item = u16>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join("-")
}

/// JA3 with extensions sorted, as an MD5 hex digest.
pub fn ja3n(hello: &ClientHello) -> String {
    let versions = hello.versions();
    let has_grease = versions.iter().any(|v| is_grease(*v));
    let mut version = non_grease(&versions).max().unwrap_or_default();

    // TLS 1.3 clients advertise 1.3 in supported_versions; JA3 caps at 1.2.
    if hello.extensions.contains(&EXT_SUPPORTED_VERSIONS) && has_grease && version > TLS_1_2 {
        version = TLS_1_2;
    }

    let mut extensions: Vec<u16> = non_grease(&hello.extensions).collect();
    extensions.sort_unstable();

    let input = format!(
        "{},{},{},{},{}",
        version,
        join_decimal(non_grease(&hello.cipher_suites)),
        join_decimal(extensions.into_iter()),
        join_decimal(non_grease(&hello.supported_groups)),
        join_decimal(hello.ec_point_formats.iter().map(|p| *p as u16)),
    );

    hex::encode(Md5::digest(input.as_bytes()))
}

fn version_code(version: u16) -> String {
    match version {
        0x0300 => "s3".to_string(),
        0x0301 => "10".to_string(),
        0x0302 => "11".to_string(),
        0x0303 => "12".to_string(),
        0x0304 => "13".to_string(),
        other => {
            let v = other.wrapping_sub(0x0201);
            format!("{}{}", v >> 8, v & 0xff)
        }
    }
}

fn alpn_code(hello: &ClientHello) -> String {
    match hello.alpn_protocols.first() {
        Some(proto) if proto.len() > 1 => {
            let (first, last) = (proto[0], proto[proto.len() - 1]);
            if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() {
                format!("{}{}", first as char, last as char)
            } else {
                let hex = hex::encode([first, last]);
                format!("{}{}", &hex[..1], &hex[3..])
            }
        }
        _ => "00".to_string(),
    }
}

fn hex_list(values: &[u16]) -> String {
    let mut out = String::with_capacity(values.len() * 5);
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{v:04x}");
    }
    out
}

fn truncated_sha256(input: &str) -> String {
    if input.is_empty() {
        return "000000000000".to_string();
    }
    hex::encode(&Sha256::digest(input.as_bytes())[..6])
}

/// JA4: `<proto><version><sni><ciphers><exts><alpn>_<cipher hash>_<ext hash>`
pub fn ja4(hello: &ClientHello) -> String {
    let mut a = String::with_capacity(10);
    a.push(if hello.extensions.contains(&EXT_QUIC_TRANSPORT_PARAMETERS) {
        'q'
    } else {
        't'
    });

    let version = non_grease(&hello.versions()).max().unwrap_or_default();
    a.push_str(&version_code(version));

    let has_sni = hello.extensions.contains(&EXT_SERVER_NAME)
        && hello.server_name.as_deref().is_some_and(|n| !n.is_empty());
    a.push(if has_sni { 'd' } else { 'i' });

    let mut ciphers: Vec<u16> = non_grease(&hello.cipher_suites).collect();
    let extension_count = non_grease(&hello.extensions).count();
    let mut extensions: Vec<u16> = non_grease(&hello.extensions)
        .filter(|e| *e != EXT_SERVER_NAME && *e != EXT_ALPN)
        .collect();
    let schemes: Vec<u16> = non_grease(&hello.signature_algorithms).collect();

    let _ = write!(a, "{:02}", ciphers.len().min(99));
    let _ = write!(a, "{:02}", extension_count.min(99));
    a.push_str(&alpn_code(hello));

    ciphers.sort_unstable();
    extensions.sort_unstable();

    let mut ext_input = hex_list(&extensions);
    if !schemes.is_empty() {
        ext_input.push('_');
        ext_input.push_str(&hex_list(&schemes));
    }

    format!(
        "{}_{}_{}",
        a,
        truncated_sha256(&hex_list(&ciphers)),
        truncated_sha256(&ext_input)
    )
}

#[cfg(test)]
mod tests {
    use super::super::client_hello::tests::{
        alpn_ext, build_client_hello, sni_ext, u16_list_ext, versions_ext,
    };
    use super::super::client_hello::{
        EXT_EC_POINT_FORMATS, EXT_SIGNATURE_ALGORITHMS, EXT_SUPPORTED_GROUPS,
    };
    use super::*;

    fn modern_hello() -> ClientHello {
        let record = build_client_hello(
            0x0303,
            &[0x0a0a, 0x1301, 0x1302, 0x1303, 0xc02b],
            &[
                (0x1a1a, vec![]),
                (EXT_SERVER_NAME, sni_ext("a.example")),
                (23, vec![]),
                (EXT_SUPPORTED_GROUPS, u16_list_ext(&[0x2a2a, 0x001d, 0x0017])),
                (EXT_EC_POINT_FORMATS, vec![1, 0]),
                (EXT_SIGNATURE_ALGORITHMS, u16_list_ext(&[0x0403, 0x0804, 0x0401])),
                (EXT_ALPN, alpn_ext(&["h2", "http/1.1"])),
                (EXT_SUPPORTED_VERSIONS, versions_ext(&[0x3a3a, 0x0304, 0x0303])),
            ],
        );
        ClientHello::parse(&record).unwrap()
    }

    #[test]
    fn test_grease() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x1301));
        assert!(!is_grease(0x0a0b));
    }

    #[test]
    fn test_ja3n_input() {
        let hello = modern_hello();
        let expected_input = "771,4865-4866-4867-49195,0-10-11-13-16-23-43,29-23,0";
        assert_eq!(ja3n(&hello), hex::encode(Md5::digest(expected_input.as_bytes())));
    }

    #[test]
    fn test_ja3n_ignores_extension_order() {
        let a = build_client_hello(
            0x0303,
            &[0x1301],
            &[(EXT_SERVER_NAME, sni_ext("a.example")), (23, vec![])],
        );
        let b = build_client_hello(
            0x0303,
            &[0x1301],
            &[(23, vec![]), (EXT_SERVER_NAME, sni_ext("a.example"))],
        );
        assert_eq!(
            ja3n(&ClientHello::parse(&a).unwrap()),
            ja3n(&ClientHello::parse(&b).unwrap())
        );
    }

    #[test]
    fn test_ja4() {
        let hello = modern_hello();
        let fp = ja4(&hello);
        let parts: Vec<&str> = fp.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "t13d0407h2");
        assert_eq!(parts[1], truncated_sha256("1301,1302,1303,c02b"));
        assert_eq!(parts[2], truncated_sha256("000a,000b,000d,0017,002b_0403,0804,0401"));
    }

    #[test]
    fn test_ja4_without_sni_or_alpn() {
        let record = build_client_hello(0x0303, &[], &[]);
        let hello = ClientHello::parse(&record).unwrap();
        assert_eq!(ja4(&hello), "t12i000000_000000000000_000000000000");
    }

    #[test]
    fn test_version_codes() {
        assert_eq!(version_code(0x0300), "s3");
        assert_eq!(version_code(0x0304), "13");
        assert_eq!(version_code(0xfeff), "252254");
    }
}
