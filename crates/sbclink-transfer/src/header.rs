//! Transfer headers and response codes.

use bytes::BufMut;

use crate::crc;

/// Wire size of a transfer header.
pub const TRANSFER_HEADER_SIZE: usize = 16;

/// Wire size of a response-code exchange.
pub const RESPONSE_SIZE: usize = 4;

/// Identifies the protocol family; constant in every header.
pub const FORMAT_CODE: u8 = 0x5F;

/// Version of the transfer protocol spoken by this host.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum payload bytes per transfer.
pub const MAX_PAYLOAD: usize = 2048;

/// The 16-byte header exchanged at the start of every transfer.
///
/// `checksum_header` covers bytes 0..12 (everything but itself) and is
/// verified before any other field is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub format_code: u8,
    pub num_packets: u8,
    pub protocol_version: u16,
    pub sequence_number: u16,
    pub data_length: u16,
    pub checksum_data: u32,
}

/// Why a received header was rejected; maps onto the response code we send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    BadChecksum { expected: u32, actual: u32 },
    BadFormat(u8),
    BadVersion(u16),
    BadLength(u16),
}

impl TransferHeader {
    /// Build the header describing a payload about to be sent.
    pub fn for_payload(num_packets: u8, sequence_number: u16, payload: &[u8]) -> Self {
        Self {
            format_code: FORMAT_CODE,
            num_packets,
            protocol_version: PROTOCOL_VERSION,
            sequence_number,
            data_length: payload.len() as u16,
            checksum_data: crc::checksum(payload),
        }
    }

    /// Encode with both checksums into wire bytes.
    pub fn to_wire(&self) -> [u8; TRANSFER_HEADER_SIZE] {
        let mut buf = [0u8; TRANSFER_HEADER_SIZE];
        {
            let mut cursor = &mut buf[..];
            cursor.put_u8(self.format_code);
            cursor.put_u8(self.num_packets);
            cursor.put_u16_le(self.protocol_version);
            cursor.put_u16_le(self.sequence_number);
            cursor.put_u16_le(self.data_length);
            cursor.put_u32_le(self.checksum_data);
        }
        let header_crc = crc::checksum(&buf[..12]);
        buf[12..16].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    /// Parse wire bytes. The header checksum is verified first; no other
    /// field is read until it passes.
    pub fn parse(raw: &[u8; TRANSFER_HEADER_SIZE]) -> Result<Self, HeaderError> {
        let expected = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
        let actual = crc::checksum(&raw[..12]);
        if expected != actual {
            return Err(HeaderError::BadChecksum { expected, actual });
        }

        let header = Self {
            format_code: raw[0],
            num_packets: raw[1],
            protocol_version: u16::from_le_bytes([raw[2], raw[3]]),
            sequence_number: u16::from_le_bytes([raw[4], raw[5]]),
            data_length: u16::from_le_bytes([raw[6], raw[7]]),
            checksum_data: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        };

        if header.format_code != FORMAT_CODE {
            return Err(HeaderError::BadFormat(header.format_code));
        }
        if header.protocol_version != PROTOCOL_VERSION {
            return Err(HeaderError::BadVersion(header.protocol_version));
        }
        if header.data_length as usize > MAX_PAYLOAD {
            return Err(HeaderError::BadLength(header.data_length));
        }
        Ok(header)
    }
}

/// Verdict exchanged after the header and payload phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    Success = 1,
    BadFormat = 2,
    BadProtocolVersion = 3,
    BadHeaderChecksum = 4,
    BadDataChecksum = 5,
    /// The response word itself was unrecognised (line noise).
    BadResponse = 0x4A5A_C3F7,
}

impl ResponseCode {
    pub fn to_wire(self) -> [u8; RESPONSE_SIZE] {
        (self as u32).to_le_bytes()
    }

    /// Unrecognised values collapse to `BadResponse`.
    pub fn from_wire(raw: [u8; RESPONSE_SIZE]) -> Self {
        match u32::from_le_bytes(raw) {
            1 => ResponseCode::Success,
            2 => ResponseCode::BadFormat,
            3 => ResponseCode::BadProtocolVersion,
            4 => ResponseCode::BadHeaderChecksum,
            5 => ResponseCode::BadDataChecksum,
            _ => ResponseCode::BadResponse,
        }
    }
}

impl From<HeaderError> for ResponseCode {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::BadChecksum { .. } => ResponseCode::BadHeaderChecksum,
            HeaderError::BadFormat(_) => ResponseCode::BadFormat,
            HeaderError::BadVersion(_) => ResponseCode::BadProtocolVersion,
            HeaderError::BadLength(_) => ResponseCode::BadFormat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let header = TransferHeader::for_payload(2, 42, &payload);
        let wire = header.to_wire();

        let parsed = TransferHeader::parse(&wire).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.data_length, 8);
        assert_eq!(parsed.checksum_data, crc::checksum(&payload));
    }

    #[test]
    fn corrupting_any_byte_is_detected() {
        let header = TransferHeader::for_payload(1, 7, &[0xAB; 16]);
        let wire = header.to_wire();

        for i in 0..TRANSFER_HEADER_SIZE {
            let mut bad = wire;
            bad[i] ^= 0x40;
            assert!(
                TransferHeader::parse(&bad).is_err(),
                "corruption at byte {i} undetected"
            );
        }
    }

    #[test]
    fn checksum_checked_before_fields() {
        // A header that would fail the format check, but with a broken
        // checksum: the checksum error must win.
        let mut wire = TransferHeader::for_payload(0, 0, &[]).to_wire();
        wire[0] = 0xEE; // breaks both format and header checksum
        assert!(matches!(
            TransferHeader::parse(&wire),
            Err(HeaderError::BadChecksum { .. })
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let mut header = TransferHeader::for_payload(0, 0, &[]);
        header.protocol_version = 99;
        let wire = header.to_wire();
        assert_eq!(
            TransferHeader::parse(&wire),
            Err(HeaderError::BadVersion(99))
        );
    }

    #[test]
    fn oversized_length_rejected() {
        let mut header = TransferHeader::for_payload(0, 0, &[]);
        header.data_length = (MAX_PAYLOAD + 1) as u16;
        let wire = header.to_wire();
        assert_eq!(
            TransferHeader::parse(&wire),
            Err(HeaderError::BadLength(2049))
        );
    }

    #[test]
    fn response_code_roundtrip() {
        for code in [
            ResponseCode::Success,
            ResponseCode::BadFormat,
            ResponseCode::BadProtocolVersion,
            ResponseCode::BadHeaderChecksum,
            ResponseCode::BadDataChecksum,
            ResponseCode::BadResponse,
        ] {
            assert_eq!(ResponseCode::from_wire(code.to_wire()), code);
        }
        assert_eq!(
            ResponseCode::from_wire(0xDEAD_BEEFu32.to_le_bytes()),
            ResponseCode::BadResponse
        );
    }
}
