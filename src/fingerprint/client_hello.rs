//! ClientHello capture and parsing.
//!
//! The TLS handshake is driven by rustls, which does not expose the raw hello,
//! so the first record is read with `peek()` before the acceptor consumes it.

use std::time::Duration;
use tokio::net::TcpStream;

const RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = RECORD_HEADER_LEN + (1 << 14) + 2048;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

const PEEK_ATTEMPTS: usize = 20;
const PEEK_BACKOFF: Duration = Duration::from_millis(10);

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_EC_POINT_FORMATS: u16 = 11;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_ALPN: u16 = 16;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;
pub const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 57;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("not a TLS handshake record")]
    NotHandshake,
    #[error("handshake message is not a ClientHello")]
    NotClientHello,
    #[error("ClientHello is truncated")]
    Truncated,
}

/// The ClientHello fields that fingerprints are computed from. Lists keep wire
/// order and include GREASE values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub supported_versions: Vec<u16>,
    pub supported_groups: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub signature_algorithms: Vec<u16>,
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.buf.len() < n {
            return Err(ParseError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, ParseError> {
        let b = self.bytes(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// Sub-reader over a block prefixed by an 8-bit length.
    fn block8(&mut self) -> Result<Reader<'a>, ParseError> {
        let len = self.u8()? as usize;
        Ok(Reader::new(self.bytes(len)?))
    }

    /// Sub-reader over a block prefixed by a 16-bit length.
    fn block16(&mut self) -> Result<Reader<'a>, ParseError> {
        let len = self.u16()? as usize;
        Ok(Reader::new(self.bytes(len)?))
    }

    fn u16_list(mut self) -> Result<Vec<u16>, ParseError> {
        let mut out = Vec::with_capacity(self.buf.len() / 2);
        while !self.is_empty() {
            out.push(self.u16()?);
        }
        Ok(out)
    }
}

/// Length of the TLS record at the start of `buf`, header included, once the
/// header is available.
pub fn record_len(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(ParseError::NotHandshake);
    }
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    Ok(Some(RECORD_HEADER_LEN + len))
}

impl ClientHello {
    /// Parse a ClientHello from a TLS record (record header included).
    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        let mut record = Reader::new(record);
        if record.u8()? != CONTENT_TYPE_HANDSHAKE {
            return Err(ParseError::NotHandshake);
        }
        record.u16()?;
        let mut fragment = record.block16()?;

        if fragment.u8()? != HANDSHAKE_CLIENT_HELLO {
            return Err(ParseError::NotClientHello);
        }
        let body_len = fragment.u24()?;
        let mut body = Reader::new(fragment.bytes(body_len)?);

        let mut hello = ClientHello {
            legacy_version: body.u16()?,
            ..Default::default()
        };
        body.bytes(32)?;
        body.block8()?;
        hello.cipher_suites = body.block16()?.u16_list()?;
        body.block8()?;

        if body.is_empty() {
            return Ok(hello);
        }

        let mut extensions = body.block16()?;
        while !extensions.is_empty() {
            let kind = extensions.u16()?;
            let mut data = extensions.block16()?;
            hello.extensions.push(kind);

            match kind {
                EXT_SERVER_NAME => hello.server_name = parse_server_name(data)?,
                EXT_SUPPORTED_GROUPS => hello.supported_groups = data.block16()?.u16_list()?,
                EXT_EC_POINT_FORMATS => hello.ec_point_formats = data.block8()?.buf.to_vec(),
                EXT_SIGNATURE_ALGORITHMS => {
                    hello.signature_algorithms = data.block16()?.u16_list()?
                }
                EXT_ALPN => {
                    let mut list = data.block16()?;
                    while !list.is_empty() {
                        hello.alpn_protocols.push(list.block8()?.buf.to_vec());
                    }
                }
                EXT_SUPPORTED_VERSIONS => {
                    hello.supported_versions = data.block8()?.u16_list()?
                }
                _ => {}
            }
        }

        Ok(hello)
    }

    /// Offered versions: the supported_versions extension, or the legacy field.
    pub fn versions(&self) -> Vec<u16> {
        if self.extensions.contains(&EXT_SUPPORTED_VERSIONS) {
            self.supported_versions.clone()
        } else {
            vec![self.legacy_version]
        }
    }
}

fn parse_server_name(mut data: Reader<'_>) -> Result<Option<String>, ParseError> {
    if data.is_empty() {
        return Ok(None);
    }
    let mut list = data.block16()?;
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.block16()?;
        if name_type == 0 {
            return Ok(Some(String::from_utf8_lossy(name.buf).into_owned()));
        }
    }
    Ok(None)
}

/// Wait until the first TLS record has fully arrived and return a copy of it
/// without consuming it from the socket.
pub async fn peek_client_hello(stream: &TcpStream) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; MAX_RECORD_LEN];

    for _ in 0..PEEK_ATTEMPTS {
        let n = stream.peek(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }

        if let Some(len) = record_len(&buf[..n]).ok()? {
            if len > MAX_RECORD_LEN {
                return None;
            }
            if n >= len {
                buf.truncate(len);
                return Some(buf);
            }
        }

        tokio::time::sleep(PEEK_BACKOFF).await;
    }

    None
}
