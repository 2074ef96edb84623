/// Errors that can occur while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The transmit buffer cannot hold the packet this cycle.
    ///
    /// Not fatal: the caller defers the packet to the next transfer.
    #[error("transmit buffer full ({needed} bytes needed, {remaining} free)")]
    BufferFull { needed: usize, remaining: usize },

    /// A packet body claims more bytes than the payload holds.
    ///
    /// The whole payload is considered corrupt when this happens.
    #[error("truncated packet (kind {kind}, body {claimed} bytes, {remaining} left in payload)")]
    Truncated {
        kind: u16,
        claimed: usize,
        remaining: usize,
    },

    /// A wire string was not valid UTF-8.
    #[error("invalid UTF-8 in packet string")]
    BadString(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
