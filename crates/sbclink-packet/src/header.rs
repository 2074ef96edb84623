use bytes::BufMut;

use crate::error::Result;
use crate::wire;

/// Size of a packet header on the wire.
pub const PACKET_HEADER_SIZE: usize = 8;

/// The fixed header preceding every packet in a transfer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet-kind tag.
    pub request: u16,
    /// Correlation id; 0 when the kind carries none.
    pub id: u16,
    /// Body length in bytes, pre-padding.
    pub length: u16,
    /// Packet id to resend, for selective resend requests.
    pub resend_packet_id: u16,
}

impl PacketHeader {
    pub fn new(request: u16, id: u16, length: u16) -> Self {
        Self {
            request,
            id,
            length,
            resend_packet_id: 0,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.request);
        buf.put_u16_le(self.id);
        buf.put_u16_le(self.length);
        buf.put_u16_le(self.resend_packet_id);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            request: wire::get_u16(buf)?,
            id: wire::get_u16(buf)?,
            length: wire::get_u16(buf)?,
            resend_packet_id: wire::get_u16(buf)?,
        })
    }
}
