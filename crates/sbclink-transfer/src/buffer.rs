use bytes::BytesMut;

use sbclink_packet::{encode_packet, Request, Result as CodecResult};

use crate::header::MAX_PAYLOAD;

/// The transmit payload under assembly for the next transfer.
///
/// Packets are appended linearly; an append that would exceed the wire
/// payload limit fails without writing so the caller can defer the packet
/// to the next cycle. The buffer is reused every transfer.
#[derive(Debug)]
pub struct TxBuffer {
    buf: BytesMut,
    packets: u8,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_PAYLOAD),
            packets: 0,
        }
    }

    /// Append one packet, all-or-nothing.
    pub fn push(&mut self, request: &Request, id: u16) -> CodecResult<()> {
        encode_packet(request, id, &mut self.buf, MAX_PAYLOAD)?;
        self.packets += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn packet_count(&self) -> u8 {
        self.packets
    }

    /// Free payload bytes left this cycle.
    pub fn remaining(&self) -> usize {
        MAX_PAYLOAD - self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.packets = 0;
    }
}

impl Default for TxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbclink_packet::{packet_wire_len, CodecError};

    #[test]
    fn appends_are_linear_and_counted() {
        let mut buf = TxBuffer::new();
        let request = Request::Ack { channel: 0 };
        let wire_len = packet_wire_len(&request);

        buf.push(&request, 1).unwrap();
        buf.push(&request, 2).unwrap();

        assert_eq!(buf.len(), 2 * wire_len);
        assert_eq!(buf.packet_count(), 2);
        assert_eq!(buf.remaining(), MAX_PAYLOAD - 2 * wire_len);
    }

    #[test]
    fn overflow_defers_without_writing() {
        let mut buf = TxBuffer::new();
        let big = Request::SetPrintFileInfo {
            info: "x".repeat(900),
        };

        buf.push(&big, 0).unwrap();
        buf.push(&big, 0).unwrap();
        let len_before = buf.len();

        let err = buf.push(&big, 0).unwrap_err();
        assert!(matches!(err, CodecError::BufferFull { .. }));
        assert_eq!(buf.len(), len_before);
        assert_eq!(buf.packet_count(), 2);
    }

    #[test]
    fn clear_resets_for_reuse() {
        let mut buf = TxBuffer::new();
        buf.push(&Request::ResetAll, 0).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.packet_count(), 0);
        assert_eq!(buf.remaining(), MAX_PAYLOAD);
    }
}
