//! Tunnel packet framing
//!
//! Format: [address:4] [port:2 LE] [flags:1] [sequence:4 BE] [extra:1] [extra bytes]
//! [body] [acks: n x u32 BE] [ack count:1]

use crate::networking::serialization::{zerocode, PacketBuffer};
use crate::networking::{NetworkError, NetworkResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Fixed size of the outbound header
pub const HEADER_SIZE: usize = 12;

/// Most acks a single packet can carry
pub const MAX_PIGGYBACK_ACKS: usize = 255;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESENT = 0x20;
        const ACK = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub target: SocketAddrV4,
    pub flags: PacketFlags,
    pub sequence: u32,
}

/// A parsed inbound packet with its body already zero-decoded
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub header: PacketHeader,
    pub body: Vec<u8>,
    pub acks: Vec<u32>,
}

/// Build an outbound packet. The ACK flag is derived from `acks`.
pub fn build_packet(header: &PacketHeader, body: &[u8], acks: &[u32]) -> Bytes {
    let mut flags = header.flags;
    flags.set(PacketFlags::ACK, !acks.is_empty());

    let mut out = BytesMut::with_capacity(HEADER_SIZE + body.len() + acks.len() * 4 + 1);
    out.put_slice(&header.target.ip().octets());
    out.put_u16_le(header.target.port());
    out.put_u8(flags.bits());
    out.put_u32(header.sequence);
    out.put_u8(0);
    out.put_slice(body);

    if !acks.is_empty() {
        for ack in acks {
            out.put_u32(*ack);
        }
        out.put_u8(acks.len() as u8);
    }
    out.freeze()
}

/// Parse an inbound packet: header, trailing acks, then the (zero-decoded) body
pub fn parse_packet(data: &[u8]) -> NetworkResult<InboundPacket> {
    let mut buffer = PacketBuffer::new(data);
    let address = buffer.take(4)?;
    let target = SocketAddrV4::new(
        Ipv4Addr::new(address[0], address[1], address[2], address[3]),
        buffer.get_u16_le()?,
    );
    let flags = PacketFlags::from_bits_truncate(buffer.get_u8()?);
    let sequence = buffer.get_u32_be()?;
    let extra = buffer.get_u8()? as usize;
    let body_start = HEADER_SIZE + extra;

    let mut body_end = data.len();
    let mut acks = Vec::new();
    if flags.contains(PacketFlags::ACK) {
        let count = *data.last().ok_or_else(|| NetworkError::malformed("Missing ack count"))? as usize;
        let ack_bytes = count * 4 + 1;
        if data.len() < body_start + ack_bytes {
            return Err(NetworkError::malformed(format!(
                "Packet of {} bytes cannot hold {} acks",
                data.len(),
                count
            )));
        }
        body_end = data.len() - ack_bytes;
        // Read back-to-front from the end of the packet
        let mut offset = data.len() - 1;
        for _ in 0..count {
            offset -= 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[offset..offset + 4]);
            acks.push(u32::from_be_bytes(raw));
        }
    }

    if body_start > body_end {
        return Err(NetworkError::malformed(format!(
            "Extra header of {} bytes runs past the body",
            extra
        )));
    }

    let raw_body = &data[body_start..body_end];
    let body = if flags.contains(PacketFlags::ZEROCODED) {
        zerocode::decode(raw_body)?
    } else {
        raw_body.to_vec()
    };

    Ok(InboundPacket {
        header: PacketHeader { target, flags, sequence },
        body,
        acks,
    })
}
