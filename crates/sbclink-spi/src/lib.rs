//! Hardware boundary for the sbclink SPI link.
//!
//! The transfer layer above is written against two small traits: [`SpiBus`]
//! for full-duplex exchanges and [`ReadyLine`] for the firmware's
//! transfer-ready signal. This crate provides the Linux implementations
//! (spidev ioctls, sysfs GPIO polling) plus [`SpiLink`] to pair them into a
//! single device object.

pub mod error;
pub mod gpio;
pub mod spidev;
pub mod traits;

pub use error::{Result, TransportError};
pub use gpio::SysfsReadyLine;
pub use spidev::SpidevBus;
pub use traits::{ReadyLine, SpiBus, SpiLink};
