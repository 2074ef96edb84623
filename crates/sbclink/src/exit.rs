use std::fmt;

use sbclink_link::LinkError;
use sbclink_transfer::TransferError;

/// Clean shutdown.
pub const SUCCESS: i32 = 0;
/// Bad configuration or command line.
pub const CONFIG_ERROR: i32 = 1;
/// The SPI transport failed fatally.
pub const TRANSPORT_FATAL: i32 = 2;
/// The firmware speaks an incompatible protocol.
pub const FIRMWARE_INCOMPATIBLE: i32 = 3;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug)]
pub struct DaemonError {
    pub code: i32,
    pub message: String,
}

impl DaemonError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(CONFIG_ERROR, message)
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DaemonError {}

impl From<LinkError> for DaemonError {
    fn from(err: LinkError) -> Self {
        let code = match &err {
            LinkError::IncompatibleFirmware { .. } => FIRMWARE_INCOMPATIBLE,
            LinkError::Transfer(TransferError::VersionMismatch { .. }) => FIRMWARE_INCOMPATIBLE,
            LinkError::Transfer(_) | LinkError::ConnectTimeout(_) => TRANSPORT_FATAL,
            LinkError::Protocol { .. } => TRANSPORT_FATAL,
        };
        Self::new(code, err.to_string())
    }
}

impl From<sbclink_spi::TransportError> for DaemonError {
    fn from(err: sbclink_spi::TransportError) -> Self {
        Self::new(TRANSPORT_FATAL, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incompatible_firmware_maps_to_exit_3() {
        let err: DaemonError = LinkError::IncompatibleFirmware { theirs: 2, ours: 1 }.into();
        assert_eq!(err.code, FIRMWARE_INCOMPATIBLE);
    }

    #[test]
    fn connect_timeout_maps_to_exit_2() {
        let err: DaemonError =
            LinkError::ConnectTimeout(std::time::Duration::from_secs(8)).into();
        assert_eq!(err.code, TRANSPORT_FATAL);
    }
}
