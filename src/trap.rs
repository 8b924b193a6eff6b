//! TCP SYN detection and reset synthesis (§4.2 classification, §4.5 steps 2-3 and 5).
//!
//! Every frame the packet forwarder reads from the TUN is classified by its leading nibble before
//! it ever reaches here (§4.2); this module only looks inside frames already known to be IPv4 or
//! IPv6, to find plain TCP SYNs (`SYN` set, `ACK`/`RST` clear) and the socket address they target.
//! It also synthesizes the TCP reset a rejected attempt completes with: the SYN is intercepted
//! before it is ever handed to the network stack (see [`crate::stack`]), so there is no listening
//! socket, and often no registered local address either, for the stack itself to reply from.

use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, TcpControl, TcpPacket,
    TcpRepr, TcpSeqNumber,
};
use std::net::{IpAddr, SocketAddr};

/// A plain TCP SYN, as found by [`inspect_packet`]: just enough to look up a handler and, if
/// rejected, to build the matching reset (§4.5 steps 2-3, 5).
#[derive(Debug, Clone, Copy)]
pub struct SynTrap {
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

/// Inspects a frame already known to be IPv4 or IPv6 for a plain TCP SYN.
///
/// Returns `None` for anything else (non-TCP, malformed, SYN-ACK, RST): those frames are simply
/// forwarded into the stack unchanged by the caller.
pub fn inspect_packet(buffer: &[u8]) -> Option<SynTrap> {
    if buffer.len() < 20 {
        return None;
    }

    match buffer[0] >> 4 {
        4 => inspect_ipv4(buffer),
        6 => inspect_ipv6(buffer),
        _ => None,
    }
}

fn inspect_ipv4(buffer: &[u8]) -> Option<SynTrap> {
    let packet = Ipv4Packet::new_checked(buffer).ok()?;
    if packet.next_header() != IpProtocol::Tcp {
        return None;
    }
    let src = IpAddr::V4(packet.src_addr().into());
    let dst = IpAddr::V4(packet.dst_addr().into());
    inspect_tcp(packet.payload(), src, dst)
}

fn inspect_ipv6(buffer: &[u8]) -> Option<SynTrap> {
    let packet = Ipv6Packet::new_checked(buffer).ok()?;
    let (proto, offset) = skip_ipv6_extension_headers(buffer).ok()?;
    if proto != IpProtocol::Tcp || offset > buffer.len() {
        return None;
    }
    let src = IpAddr::V6(packet.src_addr().into());
    let dst = IpAddr::V6(packet.dst_addr().into());
    inspect_tcp(&buffer[offset..], src, dst)
}

fn inspect_tcp(payload: &[u8], src_ip: IpAddr, dst_ip: IpAddr) -> Option<SynTrap> {
    let tcp = TcpPacket::new_checked(payload).ok()?;
    if tcp.syn() && !tcp.ack() && !tcp.rst() {
        Some(SynTrap {
            local: SocketAddr::new(dst_ip, tcp.dst_port()),
            peer: SocketAddr::new(src_ip, tcp.src_port()),
        })
    } else {
        None
    }
}

/// Walks IPv6 extension headers to find the first upper-layer protocol, per RFC 8200 §4.
fn skip_ipv6_extension_headers(buffer: &[u8]) -> Result<(IpProtocol, usize), ()> {
    if buffer.len() < 40 {
        return Err(());
    }
    let mut next_header = IpProtocol::from(buffer[6]);
    let mut offset = 40;

    for _ in 0..10 {
        match next_header {
            IpProtocol::HopByHop
            | IpProtocol::Ipv6Route
            | IpProtocol::Ipv6Frag
            | IpProtocol::Ipv6Opts => {
                if offset + 2 > buffer.len() {
                    return Err(());
                }
                let next = IpProtocol::from(buffer[offset]);
                let hdr_len = if next_header == IpProtocol::Ipv6Frag {
                    8
                } else {
                    (buffer[offset + 1] as usize + 1) * 8
                };
                next_header = next;
                offset += hdr_len;
            }
            _ => return Ok((next_header, offset)),
        }
    }
    Err(())
}

/// Builds the `RST, ACK` reply to a rejected SYN (§4.5 steps 3 and 5), addressed and sequenced so
/// the client's TCP stack reports connection-refused rather than a timeout.
pub fn build_reset(original: &[u8]) -> Option<Bytes> {
    if original.is_empty() {
        return None;
    }
    match original[0] >> 4 {
        4 => build_reset_v4(original),
        6 => build_reset_v6(original),
        _ => None,
    }
}

fn build_reset_v4(original: &[u8]) -> Option<Bytes> {
    let ip = Ipv4Packet::new_checked(original).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let incoming = TcpPacket::new_checked(ip.payload()).ok()?;
    let tcp_repr = reset_repr(&incoming);

    let ip_repr = Ipv4Repr {
        src_addr: ip.dst_addr(),
        dst_addr: ip.src_addr(),
        next_header: IpProtocol::Tcp,
        payload_len: tcp_repr.buffer_len(),
        hop_limit: 64,
    };

    let src = IpAddress::Ipv4(ip_repr.src_addr);
    let dst = IpAddress::Ipv4(ip_repr.dst_addr);
    emit_reset(ip_repr.buffer_len(), tcp_repr, src, dst, |buf| {
        let mut packet = Ipv4Packet::new_unchecked(buf);
        ip_repr.emit(&mut packet, &ChecksumCapabilities::default());
    })
}

fn build_reset_v6(original: &[u8]) -> Option<Bytes> {
    let ip = Ipv6Packet::new_checked(original).ok()?;
    let (proto, offset) = skip_ipv6_extension_headers(original).ok()?;
    if proto != IpProtocol::Tcp || offset > original.len() {
        return None;
    }
    let incoming = TcpPacket::new_checked(&original[offset..]).ok()?;
    let tcp_repr = reset_repr(&incoming);

    let ip_repr = Ipv6Repr {
        src_addr: ip.dst_addr(),
        dst_addr: ip.src_addr(),
        next_header: IpProtocol::Tcp,
        payload_len: tcp_repr.buffer_len(),
        hop_limit: 64,
    };

    let src = IpAddress::Ipv6(ip_repr.src_addr);
    let dst = IpAddress::Ipv6(ip_repr.dst_addr);
    emit_reset(ip_repr.buffer_len(), tcp_repr, src, dst, |buf| {
        let mut packet = Ipv6Packet::new_unchecked(buf);
        ip_repr.emit(&mut packet);
    })
}

fn reset_repr(incoming: &TcpPacket<&[u8]>) -> TcpRepr<'static> {
    TcpRepr {
        src_port: incoming.dst_port(),
        dst_port: incoming.src_port(),
        control: TcpControl::Rst,
        seq_number: TcpSeqNumber(0),
        ack_number: Some(incoming.seq_number() + 1),
        window_len: 0,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        payload: &[],
    }
}

fn emit_reset(
    ip_header_len: usize,
    tcp_repr: TcpRepr<'_>,
    src: IpAddress,
    dst: IpAddress,
    emit_ip: impl FnOnce(&mut [u8]),
) -> Option<Bytes> {
    let mut buf = vec![0u8; ip_header_len + tcp_repr.buffer_len()];
    emit_ip(&mut buf[..ip_header_len]);

    let mut tcp_packet = TcpPacket::new_unchecked(&mut buf[ip_header_len..]);
    tcp_repr.emit(&mut tcp_packet, &src, &dst, &ChecksumCapabilities::default());

    Some(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_ip_frame_is_unrecognized() {
        let frame = [0u8; 20];
        assert!(inspect_packet(&frame).is_none());
    }

    #[test]
    fn short_frame_is_unrecognized() {
        let frame = [0x60, 0, 0];
        assert!(inspect_packet(&frame).is_none());
    }

    #[test]
    fn reset_is_none_for_garbage() {
        assert!(build_reset(&[]).is_none());
        assert!(build_reset(&[0x60, 0, 0]).is_none());
    }
}
