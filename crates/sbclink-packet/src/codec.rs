//! Packet-level encode/decode over a transfer payload.
//!
//! A payload is a dense sequence of `PacketHeader` + body records, each
//! 4-byte aligned. Encoding is all-or-nothing against a capacity limit so a
//! packet that does not fit this cycle can be retried untouched next cycle.

use bytes::BytesMut;
use tracing::warn;

use crate::error::{CodecError, Result};
use crate::header::{PacketHeader, PACKET_HEADER_SIZE};
use crate::requests::Request;
use crate::responses::{Response, ResponseKind};
use crate::wire;

/// Total wire size of a request packet (header + padded body).
pub fn packet_wire_len(request: &Request) -> usize {
    PACKET_HEADER_SIZE + wire::pad4(request.body_len())
}

/// Append one packet to `out`, refusing to exceed `capacity` total bytes.
///
/// On `BufferFull` nothing has been written.
pub fn encode_packet(
    request: &Request,
    id: u16,
    out: &mut BytesMut,
    capacity: usize,
) -> Result<()> {
    let needed = packet_wire_len(request);
    let remaining = capacity.saturating_sub(out.len());
    if needed > remaining {
        return Err(CodecError::BufferFull { needed, remaining });
    }

    let body_len = request.body_len();
    let header = PacketHeader::new(request.kind() as u16, id, body_len as u16);
    header.encode(out);
    request.encode_body(out);
    debug_assert_eq!(out.len() % 4, 0, "packet bodies are 4-byte aligned");
    Ok(())
}

/// Iterates the packets of a received payload.
///
/// A body that overruns the payload poisons the rest of it: the iterator
/// yields the error once, then stops. Unknown kinds are logged and skipped.
pub struct PacketReader<'a> {
    payload: &'a [u8],
    poisoned: bool,
}

impl<'a> PacketReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            poisoned: false,
        }
    }
}

impl Iterator for PacketReader<'_> {
    type Item = Result<(PacketHeader, Response)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.poisoned || self.payload.is_empty() {
                return None;
            }
            if self.payload.len() < PACKET_HEADER_SIZE {
                self.poisoned = true;
                return Some(Err(CodecError::Truncated {
                    kind: 0,
                    claimed: PACKET_HEADER_SIZE,
                    remaining: self.payload.len(),
                }));
            }

            let mut cursor = self.payload;
            let header = match PacketHeader::decode(&mut cursor) {
                Ok(header) => header,
                Err(err) => {
                    self.poisoned = true;
                    return Some(Err(err));
                }
            };

            let body_len = header.length as usize;
            let padded = wire::pad4(body_len);
            if padded > cursor.len() {
                self.poisoned = true;
                return Some(Err(CodecError::Truncated {
                    kind: header.request,
                    claimed: body_len,
                    remaining: cursor.len(),
                }));
            }

            let body = &cursor[..body_len];
            self.payload = &cursor[padded..];

            let Some(kind) = ResponseKind::from_u16(header.request) else {
                warn!(kind = header.request, id = header.id, "skipping unknown packet kind");
                continue;
            };

            return Some(match Response::decode(kind, body) {
                Ok(response) => Ok((header, response)),
                Err(err) => {
                    self.poisoned = true;
                    Err(err)
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CodeChannel;
    use crate::responses::ReplyFlags;

    fn raw_packet(kind: u16, id: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        PacketHeader::new(kind, id, body.len() as u16).encode(&mut out);
        out.extend_from_slice(body);
        for _ in body.len()..wire::pad4(body.len()) {
            out.push(0);
        }
        out
    }

    fn code_reply_body(flags: u32, content: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&flags.to_le_bytes());
        wire::put_string(&mut body, content);
        body
    }

    #[test]
    fn encode_respects_capacity() {
        let request = Request::GetObjectModel {
            key: "move".into(),
            flags: String::new(),
        };
        let needed = packet_wire_len(&request);

        let mut out = BytesMut::new();
        let err = encode_packet(&request, 1, &mut out, needed - 1).unwrap_err();
        assert!(matches!(err, CodecError::BufferFull { .. }));
        assert!(out.is_empty(), "failed encode must write nothing");

        encode_packet(&request, 1, &mut out, needed).unwrap();
        assert_eq!(out.len(), needed);
    }

    #[test]
    fn reader_yields_packets_in_order() {
        let mut payload = Vec::new();
        payload.extend(raw_packet(
            ResponseKind::CodeReply as u16,
            1,
            &code_reply_body(ReplyFlags::for_channel(CodeChannel::Usb).0, "ok"),
        ));
        payload.extend(raw_packet(ResponseKind::ResourceLocked as u16, 0, &[3, 0, 0, 0]));

        let packets: Vec<_> = PacketReader::new(&payload)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0.id, 1);
        assert!(matches!(packets[0].1, Response::CodeReply { .. }));
        assert_eq!(
            packets[1].1,
            Response::ResourceLocked {
                channel: CodeChannel::Usb
            }
        );
    }

    #[test]
    fn unknown_kind_skipped() {
        let mut payload = raw_packet(999, 0, &[1, 2, 3, 4]);
        payload.extend(raw_packet(ResponseKind::ResourceLocked as u16, 0, &[0, 0, 0, 0]));

        let packets: Vec<_> = PacketReader::new(&payload)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn overrunning_body_poisons_payload() {
        let mut payload = Vec::new();
        PacketHeader::new(ResponseKind::CodeReply as u16, 1, 64).encode(&mut payload);
        payload.extend_from_slice(&[0u8; 8]); // body claims 64, only 8 present

        let mut reader = PacketReader::new(&payload);
        assert!(matches!(
            reader.next(),
            Some(Err(CodecError::Truncated { claimed: 64, .. }))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn empty_payload_yields_nothing() {
        assert!(PacketReader::new(&[]).next().is_none());
    }
}
