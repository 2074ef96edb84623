use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::ReadyLine;

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// The firmware's transfer-ready pin, watched through the sysfs GPIO
/// interface.
///
/// The pin is exported as an input with a rising-edge interrupt; waiting is
/// a `poll(2)` on the value file with `POLLPRI`. A line that is already high
/// when the wait starts is reported ready without blocking, so a firmware
/// that asserted between transfers is never missed.
pub struct SysfsReadyLine {
    pin: u32,
    value_file: File,
}

impl SysfsReadyLine {
    /// Export and configure the given GPIO number.
    pub fn open(pin: u32) -> Result<Self> {
        let gpio_err = |op: &'static str| {
            move |source: std::io::Error| TransportError::Gpio { pin, op, source }
        };

        // Exporting an already-exported pin reports EBUSY; that is fine.
        if let Err(err) = write_sysfs(&PathBuf::from(format!("{SYSFS_GPIO_ROOT}/export")), pin) {
            if err.raw_os_error() != Some(libc::EBUSY) {
                return Err(gpio_err("export")(err));
            }
        }

        let pin_dir = PathBuf::from(format!("{SYSFS_GPIO_ROOT}/gpio{pin}"));
        std::fs::write(pin_dir.join("direction"), "in").map_err(gpio_err("set direction"))?;
        std::fs::write(pin_dir.join("edge"), "rising").map_err(gpio_err("set edge"))?;

        let value_file = OpenOptions::new()
            .read(true)
            .open(pin_dir.join("value"))
            .map_err(gpio_err("open value"))?;

        info!(pin, "transfer-ready gpio configured");
        Ok(Self { pin, value_file })
    }

    fn read_level(&mut self) -> Result<bool> {
        let map_err = |source| TransportError::Gpio {
            pin: self.pin,
            op: "read value",
            source,
        };
        self.value_file.seek(SeekFrom::Start(0)).map_err(map_err)?;
        let mut buf = [0u8; 1];
        self.value_file.read_exact(&mut buf).map_err(map_err)?;
        Ok(buf[0] == b'1')
    }
}

impl ReadyLine for SysfsReadyLine {
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        // Level check first: an already-asserted line must not block on the
        // next edge.
        if self.read_level()? {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(pin = self.pin, "ready wait timed out");
                return Ok(false);
            }

            let mut fds = libc::pollfd {
                fd: self.value_file.as_raw_fd(),
                events: libc::POLLPRI | libc::POLLERR,
                revents: 0,
            };
            // SAFETY: `fds` is a valid pollfd for an open descriptor and the
            // timeout fits in c_int after the millisecond clamp.
            let rc = unsafe { libc::poll(&mut fds, 1, remaining.as_millis().min(i32::MAX as u128) as libc::c_int) };
            match rc {
                0 => return Ok(false),
                n if n < 0 => {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(TransportError::Gpio {
                        pin: self.pin,
                        op: "poll",
                        source: err,
                    });
                }
                _ => {
                    if self.read_level()? {
                        return Ok(true);
                    }
                    // Spurious wake or falling edge; keep waiting.
                }
            }
        }
    }
}

impl Drop for SysfsReadyLine {
    fn drop(&mut self) {
        let unexport = PathBuf::from(format!("{SYSFS_GPIO_ROOT}/unexport"));
        if let Err(err) = write_sysfs(&unexport, self.pin) {
            warn!(pin = self.pin, %err, "failed to unexport gpio");
        }
    }
}

fn write_sysfs(path: &PathBuf, pin: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(pin.to_string().as_bytes())
}
