use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Discriminator for the three kinds of packets on the wire.
///
/// ACK is a single-packet kind acknowledging a whole RPC; it never carries a
///  payload and is never fragmented.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    Ack = 2,
}

/// The fixed-size header at the start of every datagram - all numbers
///  little-endian:
/// ```ascii
/// 0:  rpc id (u64 LE) - correlation id chosen by the caller, echoed on the
///      response
/// 8:  total packets (u16 LE) - number of fragments the payload is split into
/// 10: sequence number (u16 LE) - this fragment's position, 0-based
/// 12: packet type (u8): 0=REQUEST 1=RESPONSE 2=ACK
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub rpc_id: u64,
    pub total_packets: u16,
    pub seq_number: u16,
    pub packet_type: PacketType,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u64>() + 2 * size_of::<u16>() + size_of::<u8>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.rpc_id);
        buf.put_u16_le(self.total_packets);
        buf.put_u16_le(self.seq_number);
        buf.put_u8(self.packet_type.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let rpc_id = buf.try_get_u64_le()?;
        let total_packets = buf.try_get_u16_le()?;
        let seq_number = buf.try_get_u16_le()?;
        let packet_type = PacketType::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid packet type discriminator: {}", e.number))?;

        Ok(PacketHeader {
            rpc_id,
            total_packets,
            seq_number,
            packet_type,
        })
    }
}

/// One datagram-sized unit on the wire: header plus the fragment of the
///  payload that fits next to it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Serialize into a fresh buffer holding the complete datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + self.payload.len());
        self.header.ser(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a received datagram. The payload is everything after the header.
    pub fn decode(mut buf: &[u8]) -> anyhow::Result<Packet> {
        let header = PacketHeader::deser(&mut buf)?;
        Ok(Packet {
            header,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
