use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{check_lengths, SpiBus};

// Linux spidev ioctl numbers (ioctl.h encoding, magic 'k').
const SPI_IOC_WR_MODE: libc::c_ulong = 0x4001_6b01;
const SPI_IOC_WR_BITS_PER_WORD: libc::c_ulong = 0x4001_6b03;
const SPI_IOC_WR_MAX_SPEED_HZ: libc::c_ulong = 0x4004_6b04;
const SPI_IOC_MESSAGE_1: libc::c_ulong = 0x4020_6b00;

/// Mirror of the kernel's `struct spi_ioc_transfer`.
#[repr(C)]
#[derive(Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

/// An SPI master behind a `/dev/spidevB.D` character device.
///
/// Configured for mode 0, 8 bits per word. The clock speed is fixed at
/// construction and applied to every exchange.
pub struct SpidevBus {
    file: File,
    path: PathBuf,
    speed_hz: u32,
}

impl SpidevBus {
    /// Open and configure an spidev node.
    pub fn open(path: impl AsRef<Path>, speed_hz: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TransportError::Open {
                path: path.clone(),
                source: e,
            })?;

        let bus = Self {
            file,
            path,
            speed_hz,
        };
        bus.write_ioctl(SPI_IOC_WR_MODE, &0u8, "set SPI mode")?;
        bus.write_ioctl(SPI_IOC_WR_BITS_PER_WORD, &8u8, "set bits per word")?;
        bus.write_ioctl(SPI_IOC_WR_MAX_SPEED_HZ, &speed_hz, "set bus speed")?;

        info!(path = ?bus.path, speed_hz, "spi device configured");
        Ok(bus)
    }

    /// The device path this bus was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_ioctl<T>(&self, request: libc::c_ulong, value: &T, op: &'static str) -> Result<()> {
        // SAFETY: `value` is a valid, live pointer to a type matching the
        // ioctl's expected argument, and the fd is an open spidev descriptor
        // owned by this struct.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request,
                value as *const T as *const libc::c_void,
            )
        };
        if rc < 0 {
            return Err(TransportError::Ioctl {
                op,
                path: self.path.clone(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl SpiBus for SpidevBus {
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        check_lengths(tx, rx)?;

        let xfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.speed_hz,
            bits_per_word: 8,
            ..SpiIocTransfer::default()
        };

        // SAFETY: `xfer` references buffers that outlive the ioctl call, the
        // lengths are consistent, and the fd is a configured spidev device.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), SPI_IOC_MESSAGE_1, &xfer) };
        if rc < 0 {
            return Err(TransportError::Ioctl {
                op: "full-duplex transfer",
                path: self.path.clone(),
                source: std::io::Error::last_os_error(),
            });
        }

        debug!(bytes = tx.len(), "spi exchange complete");
        Ok(())
    }
}
