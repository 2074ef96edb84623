use std::path::PathBuf;

/// Errors that can occur on the SPI hardware boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to open the SPI device node.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An ioctl on the SPI device failed.
    #[error("{op} failed on {path}: {source}")]
    Ioctl {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    /// GPIO setup or polling failed.
    #[error("gpio {pin} {op} failed: {source}")]
    Gpio {
        pin: u32,
        op: &'static str,
        source: std::io::Error,
    },

    /// Full-duplex exchange called with mismatched buffer lengths.
    #[error("exchange length mismatch (tx {tx} bytes, rx {rx} bytes)")]
    LengthMismatch { tx: usize, rx: usize },

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
