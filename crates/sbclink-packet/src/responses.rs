//! Firmware → host packets.

use crate::channel::CodeChannel;
use crate::error::Result;
use crate::wire;

/// Packet-kind tags for firmware → host packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseKind {
    ObjectModel = 1,
    CodeBufferUpdate = 2,
    CodeReply = 3,
    ExecuteMacro = 4,
    AbortFile = 5,
    PrintPaused = 6,
    Message = 7,
    ResourceLocked = 8,
    FileChunkRequest = 9,
    EvaluationResult = 10,
    DoCode = 11,
}

impl ResponseKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => ResponseKind::ObjectModel,
            2 => ResponseKind::CodeBufferUpdate,
            3 => ResponseKind::CodeReply,
            4 => ResponseKind::ExecuteMacro,
            5 => ResponseKind::AbortFile,
            6 => ResponseKind::PrintPaused,
            7 => ResponseKind::Message,
            8 => ResponseKind::ResourceLocked,
            9 => ResponseKind::FileChunkRequest,
            10 => ResponseKind::EvaluationResult,
            11 => ResponseKind::DoCode,
            _ => return None,
        })
    }
}

/// Flags attached to code replies and messages.
///
/// Bits 0..=11 select destination channels; the high bits qualify the
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyFlags(pub u32);

impl ReplyFlags {
    pub const CHANNEL_MASK: u32 = 0x0FFF;
    /// More content follows in another reply with the same id.
    pub const PUSH: u32 = 1 << 28;
    pub const WARNING: u32 = 1 << 29;
    pub const ERROR: u32 = 1 << 30;
    /// Content is for the log only, not a code result.
    pub const LOG_OFF: u32 = 1 << 31;

    pub fn for_channel(channel: CodeChannel) -> Self {
        Self(1 << channel.index())
    }

    pub fn contains_channel(self, channel: CodeChannel) -> bool {
        self.0 & (1 << channel.index()) != 0
    }

    /// Channels addressed by this reply, in wire order.
    pub fn channels(self) -> impl Iterator<Item = CodeChannel> {
        CodeChannel::ALL
            .into_iter()
            .filter(move |c| self.contains_channel(*c))
    }

    pub fn is_push(self) -> bool {
        self.0 & Self::PUSH != 0
    }

    pub fn is_warning(self) -> bool {
        self.0 & Self::WARNING != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn with(self, bits: u32) -> Self {
        Self(self.0 | bits)
    }
}

/// Why the firmware paused the print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    User,
    Gcode,
    FilamentChange,
    Trigger,
    Heater,
    Filament,
    Stall,
    LowVoltage,
    Driver,
    Unknown(u8),
}

impl PauseReason {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PauseReason::User,
            1 => PauseReason::Gcode,
            2 => PauseReason::FilamentChange,
            3 => PauseReason::Trigger,
            4 => PauseReason::Heater,
            5 => PauseReason::Filament,
            6 => PauseReason::Stall,
            7 => PauseReason::LowVoltage,
            8 => PauseReason::Driver,
            other => PauseReason::Unknown(other),
        }
    }
}

/// A decoded firmware → host packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A JSON patch for the object-model mirror.
    ObjectModel { data: String },
    /// Remaining space in the firmware's code buffer, in bytes.
    CodeBufferUpdate { buffer_space: u16 },
    /// The (possibly partial) result of a code; correlated by header id.
    CodeReply { flags: ReplyFlags, content: String },
    /// The firmware wants a macro file run on a channel.
    ExecuteMacro {
        channel: CodeChannel,
        report_missing: bool,
        from_code: bool,
        filename: String,
    },
    /// The firmware aborted the file(s) being executed on a channel.
    AbortFile {
        channel: CodeChannel,
        abort_all: bool,
    },
    /// The print was paused at the given file position.
    PrintPaused {
        file_position: u32,
        reason: PauseReason,
    },
    /// A free-form message for the user or the log.
    Message { flags: ReplyFlags, content: String },
    /// A movement/resource lock request was granted.
    ResourceLocked { channel: CodeChannel },
    /// The firmware wants a chunk of a file.
    FileChunkRequest {
        offset: u32,
        max_length: u32,
        filename: String,
    },
    /// Result of an `EvaluateExpression` request.
    EvaluationResult {
        channel: CodeChannel,
        error: bool,
        value: String,
    },
    /// The firmware asks the host to run a code out of band.
    DoCode { channel: CodeChannel, code: String },
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::ObjectModel { .. } => ResponseKind::ObjectModel,
            Response::CodeBufferUpdate { .. } => ResponseKind::CodeBufferUpdate,
            Response::CodeReply { .. } => ResponseKind::CodeReply,
            Response::ExecuteMacro { .. } => ResponseKind::ExecuteMacro,
            Response::AbortFile { .. } => ResponseKind::AbortFile,
            Response::PrintPaused { .. } => ResponseKind::PrintPaused,
            Response::Message { .. } => ResponseKind::Message,
            Response::ResourceLocked { .. } => ResponseKind::ResourceLocked,
            Response::FileChunkRequest { .. } => ResponseKind::FileChunkRequest,
            Response::EvaluationResult { .. } => ResponseKind::EvaluationResult,
            Response::DoCode { .. } => ResponseKind::DoCode,
        }
    }

    /// Body size pre-padding, as declared in the packet header.
    pub fn body_len(&self) -> usize {
        match self {
            Response::ObjectModel { data } => wire::string_wire_len(data),
            Response::CodeBufferUpdate { .. } => 4,
            Response::CodeReply { content, .. } => 4 + wire::string_wire_len(content),
            Response::ExecuteMacro { filename, .. } => 4 + wire::string_wire_len(filename),
            Response::AbortFile { .. } => 4,
            Response::PrintPaused { .. } => 8,
            Response::Message { content, .. } => 4 + wire::string_wire_len(content),
            Response::ResourceLocked { .. } => 4,
            Response::FileChunkRequest { filename, .. } => 8 + wire::string_wire_len(filename),
            Response::EvaluationResult { value, .. } => 4 + wire::string_wire_len(value),
            Response::DoCode { code, .. } => 4 + wire::string_wire_len(code),
        }
    }

    /// Append the body (padding included) to `buf`.
    ///
    /// Used by the simulated firmware peer and by tests; the real firmware
    /// produces these bytes on the other side of the bus.
    pub fn encode_body(&self, buf: &mut impl bytes::BufMut) {
        match self {
            Response::ObjectModel { data } => wire::put_string(buf, data),
            Response::CodeBufferUpdate { buffer_space } => {
                buf.put_u16_le(*buffer_space);
                buf.put_u16_le(0);
            }
            Response::CodeReply { flags, content } => {
                buf.put_u32_le(flags.0);
                wire::put_string(buf, content);
            }
            Response::ExecuteMacro {
                channel,
                report_missing,
                from_code,
                filename,
            } => {
                buf.put_u8(*channel as u8);
                buf.put_u8(u8::from(*report_missing));
                buf.put_u8(u8::from(*from_code));
                buf.put_u8(0);
                wire::put_string(buf, filename);
            }
            Response::AbortFile { channel, abort_all } => {
                buf.put_u8(*channel as u8);
                buf.put_u8(u8::from(*abort_all));
                buf.put_u16_le(0);
            }
            Response::PrintPaused {
                file_position,
                reason,
            } => {
                buf.put_u32_le(*file_position);
                buf.put_u8(match reason {
                    PauseReason::User => 0,
                    PauseReason::Gcode => 1,
                    PauseReason::FilamentChange => 2,
                    PauseReason::Trigger => 3,
                    PauseReason::Heater => 4,
                    PauseReason::Filament => 5,
                    PauseReason::Stall => 6,
                    PauseReason::LowVoltage => 7,
                    PauseReason::Driver => 8,
                    PauseReason::Unknown(other) => *other,
                });
                buf.put_slice(&[0; 3]);
            }
            Response::Message { flags, content } => {
                buf.put_u32_le(flags.0);
                wire::put_string(buf, content);
            }
            Response::ResourceLocked { channel } => {
                buf.put_u8(*channel as u8);
                buf.put_slice(&[0; 3]);
            }
            Response::FileChunkRequest {
                offset,
                max_length,
                filename,
            } => {
                buf.put_u32_le(*offset);
                buf.put_u32_le(*max_length);
                wire::put_string(buf, filename);
            }
            Response::EvaluationResult {
                channel,
                error,
                value,
            } => {
                buf.put_u8(*channel as u8);
                buf.put_u8(u8::from(*error));
                buf.put_u16_le(0);
                wire::put_string(buf, value);
            }
            Response::DoCode { channel, code } => {
                buf.put_u8(*channel as u8);
                buf.put_slice(&[0; 3]);
                wire::put_string(buf, code);
            }
        }
    }

    /// Decode one body of the given kind.
    pub fn decode(kind: ResponseKind, mut body: &[u8]) -> Result<Self> {
        let buf = &mut body;
        Ok(match kind {
            ResponseKind::ObjectModel => Response::ObjectModel {
                data: wire::get_string(buf)?,
            },
            ResponseKind::CodeBufferUpdate => {
                let buffer_space = wire::get_u16(buf)?;
                wire::skip(buf, 2)?;
                Response::CodeBufferUpdate { buffer_space }
            }
            ResponseKind::CodeReply => {
                let flags = ReplyFlags(wire::get_u32(buf)?);
                Response::CodeReply {
                    flags,
                    content: wire::get_string(buf)?,
                }
            }
            ResponseKind::ExecuteMacro => {
                let channel = CodeChannel::from_u8(wire::get_u8(buf)?);
                let report_missing = wire::get_u8(buf)? != 0;
                let from_code = wire::get_u8(buf)? != 0;
                wire::skip(buf, 1)?;
                Response::ExecuteMacro {
                    channel,
                    report_missing,
                    from_code,
                    filename: wire::get_string(buf)?,
                }
            }
            ResponseKind::AbortFile => {
                let channel = CodeChannel::from_u8(wire::get_u8(buf)?);
                let abort_all = wire::get_u8(buf)? != 0;
                wire::skip(buf, 2)?;
                Response::AbortFile { channel, abort_all }
            }
            ResponseKind::PrintPaused => {
                let file_position = wire::get_u32(buf)?;
                let reason = PauseReason::from_u8(wire::get_u8(buf)?);
                wire::skip(buf, 3)?;
                Response::PrintPaused {
                    file_position,
                    reason,
                }
            }
            ResponseKind::Message => {
                let flags = ReplyFlags(wire::get_u32(buf)?);
                Response::Message {
                    flags,
                    content: wire::get_string(buf)?,
                }
            }
            ResponseKind::ResourceLocked => {
                let channel = CodeChannel::from_u8(wire::get_u8(buf)?);
                wire::skip(buf, 3)?;
                Response::ResourceLocked { channel }
            }
            ResponseKind::FileChunkRequest => {
                let offset = wire::get_u32(buf)?;
                let max_length = wire::get_u32(buf)?;
                Response::FileChunkRequest {
                    offset,
                    max_length,
                    filename: wire::get_string(buf)?,
                }
            }
            ResponseKind::EvaluationResult => {
                let channel = CodeChannel::from_u8(wire::get_u8(buf)?);
                let error = wire::get_u8(buf)? != 0;
                wire::skip(buf, 2)?;
                Response::EvaluationResult {
                    channel,
                    error,
                    value: wire::get_string(buf)?,
                }
            }
            ResponseKind::DoCode => {
                let channel = CodeChannel::from_u8(wire::get_u8(buf)?);
                wire::skip(buf, 3)?;
                Response::DoCode {
                    channel,
                    code: wire::get_string(buf)?,
                }
            }
        })
    }
}
