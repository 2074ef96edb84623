use std::time::Duration;

use sbclink_packet::CodeChannel;
use sbclink_transfer::TransferError;

/// Errors escaping the link layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The transfer layer gave up; fatal to the process.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// No link could be established within the startup deadline.
    #[error("could not establish a link to the firmware within {0:?}")]
    ConnectTimeout(Duration),

    /// The firmware speaks an incompatible protocol version.
    #[error("firmware speaks protocol version {theirs}, this host speaks {ours}")]
    IncompatibleFirmware { theirs: u16, ours: u16 },

    /// A channel-fatal ordering or framing violation. The channel was
    /// aborted; the rest of the link keeps running.
    #[error("protocol violation on channel {channel}: {reason}")]
    Protocol {
        channel: CodeChannel,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, LinkError>;
