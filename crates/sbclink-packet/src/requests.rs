//! Host → firmware packets.
//!
//! Every kind is a fixed little-endian record, possibly followed by
//! length-prefixed strings or a data blob, padded to a 4-byte boundary.
//! `body_len` must agree byte-for-byte with `encode_body`; the transfer
//! layer relies on it to decide whether a packet still fits this cycle.

use bytes::BufMut;

use crate::code::{Code, ParameterValue};
use crate::wire;

/// Packet-kind tags for host → firmware packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestKind {
    Code = 1,
    GetObjectModel = 2,
    SetObjectModelValue = 3,
    PrintStarted = 4,
    PrintStopped = 5,
    MacroCompleted = 6,
    ResetAll = 7,
    Ack = 8,
    Reply = 9,
    LockMovementAndWaitForStandstill = 10,
    Unlock = 11,
    StartPlugin = 12,
    SetPrintFileInfo = 13,
    EvaluateExpression = 14,
    FileChunk = 15,
}

/// Why a print stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrintStopReason {
    NormalCompletion = 0,
    UserCancelled = 1,
    Abort = 2,
}

/// A host → firmware packet, ready to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Hand a code down for execution.
    Code(Code),
    /// Query part of the object model.
    GetObjectModel { key: String, flags: String },
    /// Write a single object-model field.
    SetObjectModelValue { field: String, value: String },
    /// A print job began on the File channel.
    PrintStarted { file_size: u32, filename: String },
    /// The print job ended.
    PrintStopped { reason: PrintStopReason },
    /// A macro frame finished on the given channel.
    MacroCompleted { channel: u8, error: bool },
    /// Drop all state on both sides.
    ResetAll,
    /// Acknowledge a blocking message prompt.
    Ack { channel: u8 },
    /// Answer a firmware-initiated `DoCode`.
    Reply {
        channel: u8,
        error: bool,
        content: String,
    },
    /// Ask for the global movement lock.
    LockMovementAndWaitForStandstill { channel: u8 },
    /// Release previously acquired locks.
    Unlock { channel: u8 },
    /// Notify the firmware that a plugin was started.
    StartPlugin { plugin: String },
    /// Push parsed print-file information.
    SetPrintFileInfo { info: String },
    /// Evaluate an expression in the firmware.
    EvaluateExpression { channel: u8, expression: String },
    /// A chunk of a file the firmware asked for; `data_length` is -1 on error.
    FileChunk {
        data_length: i32,
        file_length: u32,
        data: Vec<u8>,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Code(_) => RequestKind::Code,
            Request::GetObjectModel { .. } => RequestKind::GetObjectModel,
            Request::SetObjectModelValue { .. } => RequestKind::SetObjectModelValue,
            Request::PrintStarted { .. } => RequestKind::PrintStarted,
            Request::PrintStopped { .. } => RequestKind::PrintStopped,
            Request::MacroCompleted { .. } => RequestKind::MacroCompleted,
            Request::ResetAll => RequestKind::ResetAll,
            Request::Ack { .. } => RequestKind::Ack,
            Request::Reply { .. } => RequestKind::Reply,
            Request::LockMovementAndWaitForStandstill { .. } => {
                RequestKind::LockMovementAndWaitForStandstill
            }
            Request::Unlock { .. } => RequestKind::Unlock,
            Request::StartPlugin { .. } => RequestKind::StartPlugin,
            Request::SetPrintFileInfo { .. } => RequestKind::SetPrintFileInfo,
            Request::EvaluateExpression { .. } => RequestKind::EvaluateExpression,
            Request::FileChunk { .. } => RequestKind::FileChunk,
        }
    }

    /// Body size pre-padding, as declared in the packet header.
    pub fn body_len(&self) -> usize {
        match self {
            Request::Code(code) => code_body_len(code),
            Request::GetObjectModel { key, flags } => {
                wire::string_wire_len(key) + wire::string_wire_len(flags)
            }
            Request::SetObjectModelValue { field, value } => {
                wire::string_wire_len(field) + wire::string_wire_len(value)
            }
            Request::PrintStarted { filename, .. } => 4 + wire::string_wire_len(filename),
            Request::PrintStopped { .. } => 4,
            Request::MacroCompleted { .. } => 4,
            Request::ResetAll => 0,
            Request::Ack { .. } => 4,
            Request::Reply { content, .. } => 4 + wire::string_wire_len(content),
            Request::LockMovementAndWaitForStandstill { .. } => 4,
            Request::Unlock { .. } => 4,
            Request::StartPlugin { plugin } => wire::string_wire_len(plugin),
            Request::SetPrintFileInfo { info } => wire::string_wire_len(info),
            Request::EvaluateExpression { expression, .. } => {
                4 + wire::string_wire_len(expression)
            }
            Request::FileChunk { data, .. } => 8 + wire::pad4(data.len()),
        }
    }

    /// Append the body (padding included) to `buf`.
    pub fn encode_body(&self, buf: &mut impl BufMut) {
        match self {
            Request::Code(code) => encode_code(code, buf),
            Request::GetObjectModel { key, flags } => {
                wire::put_string(buf, key);
                wire::put_string(buf, flags);
            }
            Request::SetObjectModelValue { field, value } => {
                wire::put_string(buf, field);
                wire::put_string(buf, value);
            }
            Request::PrintStarted {
                file_size,
                filename,
            } => {
                buf.put_u32_le(*file_size);
                wire::put_string(buf, filename);
            }
            Request::PrintStopped { reason } => {
                buf.put_u8(*reason as u8);
                buf.put_slice(&[0; 3]);
            }
            Request::MacroCompleted { channel, error } => {
                buf.put_u8(*channel);
                buf.put_u8(u8::from(*error));
                buf.put_u16_le(0);
            }
            Request::ResetAll => {}
            Request::Ack { channel }
            | Request::LockMovementAndWaitForStandstill { channel }
            | Request::Unlock { channel } => {
                buf.put_u8(*channel);
                buf.put_slice(&[0; 3]);
            }
            Request::Reply {
                channel,
                error,
                content,
            } => {
                buf.put_u8(*channel);
                buf.put_u8(u8::from(*error));
                buf.put_u16_le(0);
                wire::put_string(buf, content);
            }
            Request::StartPlugin { plugin } => wire::put_string(buf, plugin),
            Request::SetPrintFileInfo { info } => wire::put_string(buf, info),
            Request::EvaluateExpression {
                channel,
                expression,
            } => {
                buf.put_u8(*channel);
                buf.put_slice(&[0; 3]);
                wire::put_string(buf, expression);
            }
            Request::FileChunk {
                data_length,
                file_length,
                data,
            } => {
                buf.put_i32_le(*data_length);
                buf.put_u32_le(*file_length);
                buf.put_slice(data);
                wire::put_padding(buf, data.len());
            }
        }
    }
}

/// Fixed code header: channel, flags, parameter count, letter, then the
/// major/minor numbers, file position and line number.
const CODE_HEADER_SIZE: usize = 20;
const PARAM_RECORD_SIZE: usize = 8;

/// Code flag bits.
pub mod code_flags {
    pub const HAS_EXPRESSIONS: u8 = 1 << 0;
    pub const FROM_MACRO: u8 = 1 << 1;
    pub const META: u8 = 1 << 2;
    pub const HAS_MINOR: u8 = 1 << 3;
    pub const HAS_FILE_POSITION: u8 = 1 << 4;
    pub const HAS_LINE_NUMBER: u8 = 1 << 5;
}

/// Parameter-kind bytes inside a code packet.
mod param_kind {
    pub const INT: u8 = 0;
    pub const UINT: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const STRING: u8 = 3;
    pub const EXPRESSION: u8 = 4;
}

fn code_body_len(code: &Code) -> usize {
    if code.is_meta() {
        return CODE_HEADER_SIZE + wire::string_wire_len(&code.raw);
    }
    let mut len = CODE_HEADER_SIZE + code.parameters.len() * PARAM_RECORD_SIZE;
    for param in &code.parameters {
        match &param.value {
            ParameterValue::Str(s) | ParameterValue::Expression(s) => {
                len += wire::string_wire_len(s);
            }
            _ => {}
        }
    }
    len
}

fn encode_code(code: &Code, buf: &mut impl BufMut) {
    let mut flags = 0u8;
    if code.has_expressions {
        flags |= code_flags::HAS_EXPRESSIONS;
    }
    if code.from_macro {
        flags |= code_flags::FROM_MACRO;
    }
    if code.is_meta() {
        flags |= code_flags::META;
    }
    if code.minor.is_some() {
        flags |= code_flags::HAS_MINOR;
    }
    if code.file_position.is_some() {
        flags |= code_flags::HAS_FILE_POSITION;
    }
    if code.line_number.is_some() {
        flags |= code_flags::HAS_LINE_NUMBER;
    }

    buf.put_u8(code.channel as u8);
    buf.put_u8(flags);
    buf.put_u8(if code.is_meta() {
        0
    } else {
        code.parameters.len() as u8
    });
    buf.put_u8(code.letter.map(|c| c as u8).unwrap_or(0));
    buf.put_i32_le(code.major.unwrap_or(-1));
    buf.put_i32_le(code.minor.unwrap_or(-1));
    buf.put_u32_le(code.file_position.unwrap_or(0));
    buf.put_i32_le(code.line_number.unwrap_or(0));

    if code.is_meta() {
        // Meta commands travel as raw text; the firmware parses them.
        wire::put_string(buf, &code.raw);
        return;
    }

    for param in &code.parameters {
        let (kind, value) = match &param.value {
            ParameterValue::Int(v) => (param_kind::INT, v.to_le_bytes()),
            ParameterValue::Uint(v) => (param_kind::UINT, v.to_le_bytes()),
            ParameterValue::Float(v) => (param_kind::FLOAT, v.to_le_bytes()),
            ParameterValue::Str(s) => (param_kind::STRING, (s.len() as u32).to_le_bytes()),
            ParameterValue::Expression(s) => {
                (param_kind::EXPRESSION, (s.len() as u32).to_le_bytes())
            }
        };
        buf.put_u8(param.letter as u8);
        buf.put_u8(kind);
        buf.put_u16_le(0);
        buf.put_slice(&value);
    }

    // String data follows the parameter records, in parameter order.
    for param in &code.parameters {
        if let ParameterValue::Str(s) | ParameterValue::Expression(s) = &param.value {
            wire::put_string(buf, s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CodeChannel;
    use crate::code;

    fn body_of(request: &Request) -> Vec<u8> {
        let mut buf = Vec::new();
        request.encode_body(&mut buf);
        buf
    }

    #[test]
    fn body_len_matches_encoding_for_all_kinds() {
        let code = code::parse("G1 X10 Y-2.5 P\"f.g\" S{x+1}", CodeChannel::File).unwrap();
        let requests = [
            Request::Code(code),
            Request::GetObjectModel {
                key: "heat".into(),
                flags: "d99f".into(),
            },
            Request::SetObjectModelValue {
                field: "state.atxPower".into(),
                value: "true".into(),
            },
            Request::PrintStarted {
                file_size: 1234,
                filename: "jobs/benchy.gcode".into(),
            },
            Request::PrintStopped {
                reason: PrintStopReason::UserCancelled,
            },
            Request::MacroCompleted {
                channel: 2,
                error: false,
            },
            Request::ResetAll,
            Request::Ack { channel: 0 },
            Request::Reply {
                channel: 3,
                error: true,
                content: "bad code".into(),
            },
            Request::LockMovementAndWaitForStandstill { channel: 1 },
            Request::Unlock { channel: 1 },
            Request::StartPlugin {
                plugin: "camera-streamer".into(),
            },
            Request::SetPrintFileInfo {
                info: "{\"height\":10}".into(),
            },
            Request::EvaluateExpression {
                channel: 5,
                expression: "move.axes[0].machinePosition".into(),
            },
            Request::FileChunk {
                data_length: 5,
                file_length: 100,
                data: vec![1, 2, 3, 4, 5],
            },
        ];

        for request in &requests {
            let body = body_of(request);
            assert_eq!(
                body.len(),
                request.body_len(),
                "body_len mismatch for {:?}",
                request.kind()
            );
            assert_eq!(body.len() % 4, 0, "unaligned body for {:?}", request.kind());
        }
    }

    #[test]
    fn code_header_layout() {
        let code = code::parse("G28 X", CodeChannel::Http).unwrap();
        let body = body_of(&Request::Code(code));

        assert_eq!(body[0], CodeChannel::Http as u8);
        assert_eq!(body[1], 0); // no flags
        assert_eq!(body[2], 1); // one parameter
        assert_eq!(body[3], b'G');
        assert_eq!(i32::from_le_bytes(body[4..8].try_into().unwrap()), 28);
        assert_eq!(i32::from_le_bytes(body[8..12].try_into().unwrap()), -1);
        assert_eq!(body[20], b'X');
    }

    #[test]
    fn string_parameter_value_carries_length() {
        let code = code::parse("M98 P\"macro.g\"", CodeChannel::File).unwrap();
        let body = body_of(&Request::Code(code));

        // Parameter record sits right after the 20-byte header.
        assert_eq!(body[20], b'P');
        assert_eq!(body[21], 3); // string kind
        let len = u32::from_le_bytes(body[24..28].try_into().unwrap());
        assert_eq!(len, 7);

        // Tail: string header + "macro.g" padded.
        let tail = &body[28..];
        assert_eq!(u16::from_le_bytes(tail[0..2].try_into().unwrap()), 7);
        assert_eq!(&tail[4..11], b"macro.g");
    }

    #[test]
    fn meta_code_travels_as_raw_text() {
        let code = code::parse("if sensors.probes[0].value[0] < 500", CodeChannel::File).unwrap();
        let body = body_of(&Request::Code(code.clone()));

        assert_ne!(body[1] & code_flags::META, 0);
        assert_eq!(body[3], 0); // no letter
        let tail = &body[CODE_HEADER_SIZE..];
        let text_len = u16::from_le_bytes(tail[0..2].try_into().unwrap()) as usize;
        assert_eq!(&tail[4..4 + text_len], code.raw.as_bytes());
    }

    #[test]
    fn file_chunk_padding() {
        let request = Request::FileChunk {
            data_length: 3,
            file_length: 3,
            data: vec![9, 9, 9],
        };
        let body = body_of(&request);
        assert_eq!(body.len(), 12);
        assert_eq!(&body[8..11], &[9, 9, 9]);
        assert_eq!(body[11], 0);
    }
}
