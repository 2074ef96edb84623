use sbclink_spi::TransportError;

/// Errors escaping the transfer layer.
///
/// Transient conditions (checksum retries, single ready timeouts) never
/// surface here; these are the fatal ones.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The SPI device or ready line failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The firmware never asserted the ready line.
    #[error("firmware not ready after {attempts} waits of {timeout_ms} ms")]
    NotReady { attempts: u32, timeout_ms: u64 },

    /// A phase kept failing after the retry budget was spent.
    #[error("{phase} exchange failed after {attempts} attempts")]
    RetriesExhausted { phase: &'static str, attempts: u32 },

    /// The firmware speaks a different protocol version.
    #[error("firmware protocol version {theirs} is not compatible with {ours}")]
    VersionMismatch { theirs: u16, ours: u16 },
}

pub type Result<T> = std::result::Result<T, TransferError>;
