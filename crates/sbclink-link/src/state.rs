//! Per-channel execution frames.
//!
//! Each channel carries a stack of [`State`] frames; depth 0 is the base
//! input, deeper frames are nested macros. Only the topmost frame may hand
//! codes to the firmware.

use std::collections::VecDeque;

use sbclink_packet::Code;

use crate::waiter::Completer;

/// Result of one executed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeResult {
    /// Firmware reply text, concatenated across partial replies.
    pub reply: String,
    /// False when the firmware flagged the reply as an error.
    pub success: bool,
}

/// A macro file being executed in a frame. Immutable once set, apart from
/// the EOF latch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroFile {
    pub filename: String,
    /// Whether a code (as opposed to the firmware itself) started it.
    pub from_code: bool,
    /// Set when the feeder reached end of file.
    pub finished: bool,
    /// Set when the feeder failed (e.g. the file was missing).
    pub failed: bool,
}

/// A code waiting to be handed to the firmware.
pub struct PendingCode {
    pub code: Code,
    pub ticket: u64,
    pub completer: Completer<CodeResult>,
}

/// A code handed to the firmware, awaiting its reply.
///
/// Replies resolve in hand-down order within a frame; a macro frame's codes
/// complete before the parent's start code does.
pub struct InFlight {
    pub id: u16,
    pub ticket: u64,
    pub code: Code,
    /// Reply text accumulated across partial (push-flagged) replies.
    pub reply: String,
    pub completer: Completer<CodeResult>,
}

/// A lock or unlock request, serialized per channel.
pub struct LockRequest {
    pub unlock: bool,
    /// Whether the packet for this request has been queued for transfer.
    pub sent: bool,
    pub completer: Completer<()>,
}

/// A caller awaiting drain of everything queued before it.
pub struct FlushRequest {
    /// Tickets below this must all be resolved first.
    pub barrier: u64,
    pub sync_file_streams: bool,
    pub completer: Completer<bool>,
}

/// One level of a channel's execution stack.
#[derive(Default)]
pub struct State {
    /// A blocking message prompt is outstanding; no codes go down.
    pub waiting_for_acknowledgement: bool,
    pub lock_requests: VecDeque<LockRequest>,
    /// Codes parked here while a child frame was on top.
    pub suspended_codes: VecDeque<PendingCode>,
    pub macro_file: Option<MacroFile>,
    /// Completion has been signalled to the firmware (at most once).
    pub macro_completed: bool,
    /// The code whose execution pushed this frame.
    pub start_code: Option<Code>,
    pub pending_codes: VecDeque<PendingCode>,
    /// Codes of this frame the firmware has not replied to yet.
    pub in_flight: VecDeque<InFlight>,
    pub flush_requests: VecDeque<FlushRequest>,
}

impl State {
    pub fn base() -> Self {
        Self::default()
    }

    pub fn for_macro(filename: String, from_code: bool, start_code: Option<Code>) -> Self {
        Self {
            macro_file: Some(MacroFile {
                filename,
                from_code,
                finished: false,
                failed: false,
            }),
            start_code,
            ..Self::default()
        }
    }

    /// Park pending codes while a child frame takes over.
    pub fn suspend(&mut self) {
        self.suspended_codes.append(&mut self.pending_codes);
    }

    /// Resume after the child frame popped.
    pub fn resume(&mut self) {
        // Suspended codes predate anything queued meanwhile.
        while let Some(code) = self.suspended_codes.pop_back() {
            self.pending_codes.push_front(code);
        }
    }

    pub fn is_macro(&self) -> bool {
        self.macro_file.is_some()
    }

    pub fn macro_finished(&self) -> bool {
        self.macro_file.as_ref().is_some_and(|m| m.finished)
    }
}
