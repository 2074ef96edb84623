use std::time::Duration;

use crate::error::{Result, TransportError};

/// A full-duplex SPI master.
///
/// One call clocks `tx` out while the same number of bytes arrive in `rx`.
/// Both directions move on every exchange; idle bytes are zeros.
pub trait SpiBus {
    /// Perform one full-duplex exchange. `tx` and `rx` must be equal length.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()>;
}

/// The firmware's transfer-ready signal.
///
/// The firmware asserts this line whenever it is prepared to clock the next
/// exchange. The host must not start an exchange before the line asserts.
pub trait ReadyLine {
    /// Block until the line asserts or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout; timeouts are not fatal at this layer.
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool>;
}

/// Pairs a bus with a ready line so the transfer layer owns a single device.
pub struct SpiLink<B, R> {
    bus: B,
    ready: R,
}

impl<B, R> SpiLink<B, R> {
    pub fn new(bus: B, ready: R) -> Self {
        Self { bus, ready }
    }

    /// Split back into the underlying parts.
    pub fn into_parts(self) -> (B, R) {
        (self.bus, self.ready)
    }
}

impl<B: SpiBus, R> SpiBus for SpiLink<B, R> {
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        self.bus.exchange(tx, rx)
    }
}

impl<B, R: ReadyLine> ReadyLine for SpiLink<B, R> {
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        self.ready.wait_ready(timeout)
    }
}

/// Shared guard for `SpiBus` implementations.
pub(crate) fn check_lengths(tx: &[u8], rx: &[u8]) -> Result<()> {
    if tx.len() != rx.len() {
        return Err(TransportError::LengthMismatch {
            tx: tx.len(),
            rx: rx.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBus;

    impl SpiBus for EchoBus {
        fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
            check_lengths(tx, rx)?;
            rx.copy_from_slice(tx);
            Ok(())
        }
    }

    struct AlwaysReady;

    impl ReadyLine for AlwaysReady {
        fn wait_ready(&mut self, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn link_delegates_to_both_halves() {
        let mut link = SpiLink::new(EchoBus, AlwaysReady);

        assert!(link.wait_ready(Duration::from_millis(1)).unwrap());

        let tx = [1u8, 2, 3, 4];
        let mut rx = [0u8; 4];
        link.exchange(&tx, &mut rx).unwrap();
        assert_eq!(rx, tx);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let mut link = SpiLink::new(EchoBus, AlwaysReady);
        let err = link.exchange(&[0u8; 4], &mut [0u8; 8]).unwrap_err();
        assert!(matches!(err, TransportError::LengthMismatch { tx: 4, rx: 8 }));
    }
}
