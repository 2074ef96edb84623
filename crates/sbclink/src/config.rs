use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::exit::DaemonError;

/// Daemon configuration, loaded from a JSON file with full defaults.
///
/// Unknown fields are rejected so typos fail loudly at startup instead of
/// silently running with defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// SPI device node connected to the firmware board.
    pub spi_device: PathBuf,
    /// SPI clock in Hz.
    pub spi_speed_hz: u32,
    /// GPIO number of the firmware's transfer-ready line.
    pub ready_gpio: u32,
    /// Unix socket the IPC server binds.
    pub socket_path: PathBuf,
    /// Directory macro files are read from.
    pub macros_dir: PathBuf,
    /// Directory firmware-requested file chunks are served from.
    pub files_dir: PathBuf,
    /// One-line reason file written when startup fails.
    pub start_error_file: PathBuf,
    /// Startup deadline for establishing the link, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Single transfer-ready wait, in milliseconds.
    pub ready_timeout_ms: u64,
    /// How long an IPC client's code may run before its waiter detaches,
    /// in milliseconds.
    pub ipc_reply_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spi_device: PathBuf::from("/dev/spidev0.0"),
            spi_speed_hz: 8_000_000,
            ready_gpio: 25,
            socket_path: PathBuf::from("/run/sbclink/sbclink.sock"),
            macros_dir: PathBuf::from("/opt/sbclink/sys"),
            files_dir: PathBuf::from("/opt/sbclink/sys"),
            start_error_file: PathBuf::from("/run/sbclink/start-error.txt"),
            connect_timeout_ms: 8_000,
            ready_timeout_ms: 500,
            ipc_reply_timeout_ms: 60_000,
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, DaemonError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|err| DaemonError::config(format!("cannot read {}: {err}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|err| DaemonError::config(format!("invalid config {}: {err}", path.display())))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ipc_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_reply_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.spi_speed_hz, 8_000_000);
        assert_eq!(config.ready_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = std::env::temp_dir().join(format!("sbclink-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"spiSpeedHz": 4000000, "readyGpio": 17}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.spi_speed_hz, 4_000_000);
        assert_eq!(config.ready_gpio, 17);
        assert_eq!(config.spi_device, PathBuf::from("/dev/spidev0.0"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_field_rejected() {
        let dir = std::env::temp_dir().join(format!("sbclink-config-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"spiSpeed": 1}"#).unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert_eq!(err.code, crate::exit::CONFIG_ERROR);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/sbclink.json"))).unwrap_err();
        assert_eq!(err.code, crate::exit::CONFIG_ERROR);
    }
}
