//! JA4T: TCP-stack fingerprint from the kernel's view of the connection.

use std::fmt;
use std::io;
use tokio::net::TcpStream;

const TCPI_OPT_TIMESTAMPS: u8 = 1 << 0;
const TCPI_OPT_SACK: u8 = 1 << 1;
const TCPI_OPT_WSCALE: u8 = 1 << 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ja4t {
    pub window: u32,
    pub options: Vec<u8>,
    pub mss: u16,
    pub window_scale: u8,
}

impl Ja4t {
    /// Build from `tcp_info` fields: peer window, option flags, MSS and window scale.
    pub fn from_parts(window: u32, option_flags: u8, mss: u16, window_scale: u8) -> Self {
        let mut fp = Ja4t {
            window,
            mss,
            ..Default::default()
        };
        if option_flags & TCPI_OPT_SACK != 0 {
            fp.options.extend_from_slice(&[4, 1]);
        }
        if option_flags & TCPI_OPT_TIMESTAMPS != 0 {
            fp.options.extend_from_slice(&[8, 1]);
        }
        if option_flags & TCPI_OPT_WSCALE != 0 {
            fp.options.push(3);
            fp.window_scale = window_scale;
        }
        fp
    }
}

impl fmt::Display for Ja4t {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = if self.options.is_empty() {
            "00".to_string()
        } else {
            self.options
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join("-")
        };
        write!(
            f,
            "{}_{}_{}_{}",
            self.window, options, self.mss, self.window_scale
        )
    }
}

/// Layout of `struct tcp_info` up to `tcpi_snd_wnd`.
#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct TcpInfo {
    state: u8,
    ca_state: u8,
    retransmits: u8,
    probes: u8,
    backoff: u8,
    options: u8,
    wscale: u8,
    delivery_rate_app_limited: u8,

    rto: u32,
    ato: u32,
    snd_mss: u32,
    rcv_mss: u32,

    unacked: u32,
    sacked: u32,
    lost: u32,
    retrans: u32,
    fackets: u32,

    last_data_sent: u32,
    last_ack_sent: u32,
    last_data_recv: u32,
    last_ack_recv: u32,

    pmtu: u32,
    rcv_ssthresh: u32,
    rtt: u32,
    rttvar: u32,
    snd_ssthresh: u32,
    snd_cwnd: u32,
    advmss: u32,
    reordering: u32,

    rcv_rtt: u32,
    rcv_space: u32,

    total_retrans: u32,

    pacing_rate: u64,
    max_pacing_rate: u64,
    bytes_acked: u64,
    bytes_received: u64,
    segs_out: u32,
    segs_in: u32,

    notsent_bytes: u32,
    min_rtt: u32,
    data_segs_in: u32,
    data_segs_out: u32,

    delivery_rate: u64,

    busy_time: u64,
    rwnd_limited: u64,
    sndbuf_limited: u64,

    delivered: u32,
    delivered_ce: u32,

    bytes_sent: u64,
    bytes_retrans: u64,
    dsack_dups: u32,
    reord_seen: u32,

    rcv_ooopack: u32,

    snd_wnd: u32,
}

/// Read `TCP_INFO` for the socket and derive its JA4T fingerprint.
#[cfg(target_os = "linux")]
pub fn tcp_fingerprint(stream: &TcpStream) -> io::Result<Ja4t> {
    use std::os::fd::AsRawFd;

    let mut info = TcpInfo::default();
    let mut len = std::mem::size_of::<TcpInfo>() as libc::socklen_t;

    // SAFETY: `info` is a repr(C) buffer of `len` bytes that outlives the call;
    // the kernel writes at most `len` bytes and updates `len`.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            (&mut info as *mut TcpInfo).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // The low nibble is the peer's (send) window scale.
    Ok(Ja4t::from_parts(
        info.snd_wnd,
        info.options,
        u16::try_from(info.snd_mss).unwrap_or(u16::MAX),
        info.wscale & 0x0f,
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn tcp_fingerprint(_stream: &TcpStream) -> io::Result<Ja4t> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP fingerprinting is only available on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let fp = Ja4t::from_parts(
            64240,
            TCPI_OPT_SACK | TCPI_OPT_TIMESTAMPS | TCPI_OPT_WSCALE,
            1460,
            7,
        );
        assert_eq!(fp.options, vec![4, 1, 8, 1, 3]);
        assert_eq!(fp.to_string(), "64240_4-1-8-1-3_1460_7");
    }

    #[test]
    fn test_no_options() {
        let fp = Ja4t::from_parts(29200, 0, 1400, 9);
        assert_eq!(fp.window_scale, 0);
        assert_eq!(fp.to_string(), "29200_00_1400_0");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reads_tcp_info() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let fp = tcp_fingerprint(&server).unwrap();
        assert!(fp.mss > 0);
    }
}
