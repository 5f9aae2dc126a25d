use std::future::Future;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::trace;

/// Echo payload size after the 8-byte ICMP header.
const PAYLOAD_SIZE: usize = 56;

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

static SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Why a single probe produced no sample. Loss is a metric, so callers only
/// see the absence of an RTT; the error exists for debug logging.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no echo reply within {0:?}")]
    Timeout(Duration),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("probe task failed: {0}")]
    Task(String),
}

/// Issues one echo probe and reports the round-trip time, if any.
///
/// The seam exists so schedulers can be driven by a deterministic prober in
/// tests; production uses [`IcmpProber`].
pub trait Prober: Send + Sync + 'static {
    /// Probe `addr` from `source` (None lets the OS pick), waiting at most
    /// `timeout` for the reply. `None` means the sample was lost.
    fn probe(
        &self,
        addr: IpAddr,
        source: Option<IpAddr>,
        timeout: Duration,
    ) -> impl Future<Output = Option<Duration>> + Send;
}

/// ICMP echo prober over raw or unprivileged datagram sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpProber;

impl Prober for IcmpProber {
    async fn probe(
        &self,
        addr: IpAddr,
        source: Option<IpAddr>,
        timeout: Duration,
    ) -> Option<Duration> {
        // Blocking sockets on a dedicated thread keep the timing tight;
        // async ICMP would round-trip through the reactor.
        let result = tokio::task::spawn_blocking(move || ping_once(addr, source, timeout))
            .await
            .map_err(|e| ProbeError::Task(e.to_string()));

        match result {
            Ok(Ok(rtt)) => Some(rtt),
            Ok(Err(e)) | Err(e) => {
                trace!(%addr, error = %e, "probe lost");
                None
            }
        }
    }
}

/// Send one echo request and wait for the matching reply.
fn ping_once(addr: IpAddr, source: Option<IpAddr>, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match addr {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ECHO_REQUEST_V4, ECHO_REPLY_V4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ECHO_REQUEST_V6, ECHO_REPLY_V6),
    };

    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where
    // ping_group_range allows it.
    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))?;

    if let Some(source) = source {
        socket.bind(&SocketAddr::new(source, 0).into())?;
    }

    socket.set_read_timeout(Some(timeout))?;
    socket.connect(&SocketAddr::new(addr, 0).into())?;

    let identifier: u16 = rand::random();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(request_type, addr.is_ipv4(), identifier, sequence);

    let start = Instant::now();
    socket.send(&packet)?;

    loop {
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        socket.set_read_timeout(Some(timeout - elapsed))?;

        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Socket(e)
            }
        })?;
        let rtt = start.elapsed();

        // SAFETY: recv initialized the first `len` bytes.
        let reply = unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };

        if reply_matches(reply, reply_type, identifier, sequence) {
            return Ok(rtt);
        }
        // Someone else's reply; keep waiting for ours.
    }
}

/// Check an incoming datagram for our echo reply. RAW IPv4 sockets deliver
/// the IP header too; DGRAM sockets hand us the bare ICMP message.
fn reply_matches(reply: &[u8], reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = if reply.first().map(|b| b >> 4) == Some(4) {
        20
    } else {
        0
    };

    let Some(icmp) = reply.get(offset..) else {
        return false;
    };
    if icmp.len() < 8 || icmp[0] != reply_type {
        return false;
    }

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    // Unprivileged DGRAM sockets rewrite the identifier; match on the
    // sequence alone in that case.
    (reply_id == identifier || offset == 0) && reply_seq == sequence
}

/// Build an echo request. The IPv4 checksum is filled in here; the kernel
/// computes the ICMPv6 checksum for us.
fn build_echo_request(request_type: u8, is_v4: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + PAYLOAD_SIZE];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    for (i, byte) in packet[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }

    if is_v4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += u32::from(last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_echo_request_v4() {
        let packet = build_echo_request(ECHO_REQUEST_V4, true, 0x1234, 0x0042);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], ECHO_REQUEST_V4);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x42]);
        assert_ne!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    }

    #[test]
    fn test_build_echo_request_v6_leaves_checksum_zero() {
        let packet = build_echo_request(ECHO_REQUEST_V6, false, 1, 1);
        assert_eq!(packet[0], ECHO_REQUEST_V6);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    }

    #[test]
    fn test_checksum_verifies() {
        // A packet with its checksum in place sums to 0xFFFF's complement: 0.
        let packet = build_echo_request(ECHO_REQUEST_V4, true, 0xBEEF, 7);
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        let checksum = icmp_checksum(&[0x01, 0x02, 0x03]);
        // 0x0102 + 0x0300 = 0x0402, complement 0xFBFD.
        assert_eq!(checksum, 0xFBFD);
    }

    #[test]
    fn test_reply_matches_bare_icmp() {
        let mut reply = vec![0u8; 8];
        reply[0] = ECHO_REPLY_V4;
        reply[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        reply[6..8].copy_from_slice(&0x0042u16.to_be_bytes());

        assert!(reply_matches(&reply, ECHO_REPLY_V4, 0x1234, 0x0042));
        assert!(!reply_matches(&reply, ECHO_REPLY_V4, 0x1234, 0x0043));
        assert!(!reply_matches(&reply, ECHO_REPLY_V6, 0x1234, 0x0042));
    }

    #[test]
    fn test_reply_matches_skips_ip_header() {
        let mut reply = vec![0u8; 28];
        reply[0] = 0x45; // IPv4, IHL 5
        reply[20] = ECHO_REPLY_V4;
        reply[24..26].copy_from_slice(&0x0001u16.to_be_bytes());
        reply[26..28].copy_from_slice(&0x0009u16.to_be_bytes());

        assert!(reply_matches(&reply, ECHO_REPLY_V4, 0x0001, 0x0009));
        // With the IP header present the identifier must match exactly.
        assert!(!reply_matches(&reply, ECHO_REPLY_V4, 0x0002, 0x0009));
    }

    #[test]
    fn test_reply_matches_rejects_short_packets() {
        assert!(!reply_matches(&[], ECHO_REPLY_V4, 1, 1));
        assert!(!reply_matches(&[0u8; 4], ECHO_REPLY_V4, 1, 1));
    }
}
