use sbclink_packet::{CodeChannel, PauseReason, ReplyFlags};

/// Boundary to the external collaborators.
///
/// The Processor routes firmware packets that are not channel state into
/// this trait: the object-model mirror, logging, the macro feeder and the
/// file services live behind it. Implementations must not block; they are
/// called from the Processor task between transfers.
pub trait EventSink: Send {
    /// A JSON object-model patch arrived.
    fn object_model(&self, _data: &str) {}

    /// A free-form firmware message.
    fn message(&self, _flags: ReplyFlags, _content: &str) {}

    /// The firmware asked for a macro file on a channel. The feeder is
    /// expected to push the file's codes and then signal `macro_finished`.
    fn macro_requested(
        &self,
        _channel: CodeChannel,
        _filename: &str,
        _report_missing: bool,
        _from_code: bool,
    ) {
    }

    /// The firmware paused the print at the given file position.
    fn print_paused(&self, _file_position: u32, _reason: PauseReason) {}

    /// The firmware wants a chunk of a host-side file.
    fn file_chunk_requested(&self, _filename: &str, _offset: u32, _max_length: u32) {}

    /// Result of an expression evaluation.
    fn evaluation_result(&self, _channel: CodeChannel, _error: bool, _value: &str) {}

    /// The firmware asked the host to run a code out of band.
    fn do_code(&self, _channel: CodeChannel, _code: &str) {}

    /// The firmware restarted; all channels were invalidated.
    fn firmware_reset(&self) {}
}

/// Ignores every event; used by tests and early startup.
pub struct NullSink;

impl EventSink for NullSink {}
