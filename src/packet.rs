/// IP/UDP packet codec for the tunnel data plane
///
/// Frames read from the tunnel are raw IP datagrams without any
/// link-layer framing. Parsing stops at the first thing the engine
/// does not handle: non-UDP transport, fragments, and IPv6 when the
/// engine was started IPv4-only.
use std::net::{IpAddr, SocketAddr};

use etherparse::{IpNumber, IpSlice, PacketBuilder, UdpSlice};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("truncated or malformed IP header")]
    Malformed,
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("IPv6 frame while IPv6 is disabled")]
    Ipv6Disabled,
    #[error("fragmented datagram")]
    Fragmented,
    #[error("transport is not UDP")]
    NotUdp,
    #[error("truncated UDP datagram")]
    TruncatedUdp,
    #[error("payload exceeds maximum datagram size")]
    Oversize,
}

/// A parsed UDP datagram: both ends of the 5-tuple plus the payload
/// range borrowed from the original frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: &'a [u8],
}

/// Parse a raw IP frame into a UDP datagram descriptor.
pub fn parse(frame: &[u8], ipv6_enabled: bool) -> Result<UdpDatagram<'_>, PacketError> {
    // Gate on the version nibble before handing the frame to the
    // full parser, so disabled IPv6 short-circuits cheaply.
    match frame.first().map(|b| b >> 4) {
        Some(4) => {}
        Some(6) if ipv6_enabled => {}
        Some(6) => return Err(PacketError::Ipv6Disabled),
        Some(version) => return Err(PacketError::UnsupportedVersion(version)),
        None => return Err(PacketError::Malformed),
    }

    let ip = IpSlice::from_slice(frame).map_err(|_| PacketError::Malformed)?;

    if ip.is_fragmenting_payload() {
        return Err(PacketError::Fragmented);
    }
    if ip.payload_ip_number() != IpNumber::UDP {
        return Err(PacketError::NotUdp);
    }

    let udp =
        UdpSlice::from_slice(ip.payload().payload).map_err(|_| PacketError::TruncatedUdp)?;

    Ok(UdpDatagram {
        src: SocketAddr::new(ip.source_addr(), udp.source_port()),
        dst: SocketAddr::new(ip.destination_addr(), udp.destination_port()),
        payload: udp.payload(),
    })
}

/// Emit a checksum-correct IP+UDP frame carrying `payload`.
pub fn build_udp_frame(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let builder = match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            PacketBuilder::ipv4(src_ip.octets(), dst_ip.octets(), 64).udp(src.port(), dst.port())
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            PacketBuilder::ipv6(src_ip.octets(), dst_ip.octets(), 64).udp(src.port(), dst.port())
        }
        _ => return Err(PacketError::Malformed),
    };

    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut frame, payload)
        .map_err(|_| PacketError::Oversize)?;
    Ok(frame)
}

/// Emit the response frame for a request: 5-tuple swapped, caller's
/// payload attached.
pub fn build_udp_response(
    request: &UdpDatagram<'_>,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    build_udp_frame(request.dst, request.src, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(a)), port)
    }

    fn v6(segment: u16, port: u16) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, segment)),
            port,
        )
    }

    #[test]
    fn test_v4_roundtrip() {
        let src = v4([10, 0, 0, 2], 50000);
        let dst = v4([10, 0, 0, 1], 53);
        let payload = b"\x12\x34payload";

        let frame = build_udp_frame(src, dst, payload).unwrap();
        let parsed = parse(&frame, false).unwrap();

        assert_eq!(parsed.src, src);
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.payload, payload);

        // Parsing the emitted response swaps the tuple back
        let response = build_udp_response(&parsed, b"reply").unwrap();
        let parsed_response = parse(&response, false).unwrap();
        assert_eq!(parsed_response.src, dst);
        assert_eq!(parsed_response.dst, src);
        assert_eq!(parsed_response.payload, b"reply");
    }

    #[test]
    fn test_v6_roundtrip_when_enabled() {
        let src = v6(2, 50000);
        let dst = v6(1, 53);

        let frame = build_udp_frame(src, dst, b"q").unwrap();
        let parsed = parse(&frame, true).unwrap();
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.payload, b"q");
    }

    #[test]
    fn test_v6_dropped_when_disabled() {
        let frame = build_udp_frame(v6(2, 50000), v6(1, 53), b"q").unwrap();
        assert_eq!(parse(&frame, false), Err(PacketError::Ipv6Disabled));
    }

    #[test]
    fn test_non_udp_rejected() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 2], [10, 0, 0, 1], 64).tcp(1234, 80, 0, 1024);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[]).unwrap();
        assert_eq!(parse(&frame, false), Err(PacketError::NotUdp));
    }

    #[test]
    fn test_fragment_rejected() {
        let mut frame =
            build_udp_frame(v4([10, 0, 0, 2], 50000), v4([10, 0, 0, 1], 53), b"q").unwrap();
        // Set the more-fragments flag
        frame[6] |= 0x20;
        assert_eq!(parse(&frame, false), Err(PacketError::Fragmented));
    }

    #[test]
    fn test_truncated_udp_rejected() {
        let frame =
            build_udp_frame(v4([10, 0, 0, 2], 50000), v4([10, 0, 0, 1], 53), b"payload").unwrap();

        // Cut below the IP total length: malformed at the IP layer
        assert_eq!(parse(&frame[..22], false), Err(PacketError::Malformed));

        // Shrink the IP total length under the UDP header instead:
        // the IP layer parses, the UDP layer is truncated
        let mut shrunk = frame[..22].to_vec();
        shrunk[2..4].copy_from_slice(&22u16.to_be_bytes());
        assert_eq!(parse(&shrunk, false), Err(PacketError::TruncatedUdp));
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(parse(&[], false), Err(PacketError::Malformed));
        assert_eq!(parse(&[0x00; 4], false), Err(PacketError::UnsupportedVersion(0)));
        assert_eq!(parse(&[0x45, 0x00], false), Err(PacketError::Malformed));
    }

    #[test]
    fn test_mixed_families_rejected() {
        assert_eq!(
            build_udp_frame(v4([10, 0, 0, 2], 1), v6(1, 2), b""),
            Err(PacketError::Malformed)
        );
    }
}
