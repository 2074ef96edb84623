//! The full-duplex transfer engine.
//!
//! Every transfer is up to four exchanges: header, header response, payload,
//! payload response. The state machine below makes the steps explicit;
//! transient failures (checksum rejects, single ready timeouts) are retried
//! here and never escape, while peer resets and fatal conditions surface to
//! the caller.

use std::time::Duration;

use tracing::{debug, trace, warn};

use sbclink_packet::{Request, Result as CodecResult};
use sbclink_spi::{ReadyLine, SpiBus};

use crate::buffer::TxBuffer;
use crate::error::{Result, TransferError};
use crate::header::{
    HeaderError, ResponseCode, TransferHeader, MAX_PAYLOAD, PROTOCOL_VERSION, RESPONSE_SIZE,
    TRANSFER_HEADER_SIZE,
};

/// Tunables for the exchange loop.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long one ready-line wait may take.
    pub ready_timeout: Duration,
    /// Ready-line timeouts tolerated per exchange before going fatal.
    pub max_ready_waits: u32,
    /// Checksum/format retries tolerated per transfer before going fatal.
    pub max_retries: u32,
    /// Pause between retries.
    pub retry_backoff: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_millis(500),
            max_ready_waits: 3,
            max_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// How a transfer ended, reset distinguished from plain success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Both sides exchanged and acknowledged a full transfer.
    Success,
    /// The firmware restarted; all in-flight state was dropped.
    PeerReset,
}

/// Running counters, surfaced through diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub transfers: u64,
    pub retries: u64,
    pub stalls: u64,
    pub resets: u64,
}

#[derive(Clone, Copy)]
enum Step {
    Header,
    Payload(TransferHeader),
    Done(TransferHeader),
}

enum Cycle {
    Complete(TransferHeader),
    Reset,
}

/// Owns the SPI device and the two fixed transfer buffers.
///
/// Single-owner by construction: only the Processor task touches this.
pub struct DataTransfer<L> {
    link: L,
    config: TransferConfig,
    tx: TxBuffer,
    tx_scratch: Box<[u8]>,
    tx_seq: u16,
    rx_buf: Box<[u8]>,
    rx_len: usize,
    rx_packets: u8,
    last_rx_seq: Option<u16>,
    last_transfer_ok: bool,
    had_reset: bool,
    stats: TransferStats,
}

impl<L: SpiBus + ReadyLine> DataTransfer<L> {
    pub fn new(link: L) -> Self {
        Self::with_config(link, TransferConfig::default())
    }

    pub fn with_config(link: L, config: TransferConfig) -> Self {
        Self {
            link,
            config,
            tx: TxBuffer::new(),
            tx_scratch: vec![0u8; MAX_PAYLOAD].into_boxed_slice(),
            tx_seq: 0,
            rx_buf: vec![0u8; MAX_PAYLOAD].into_boxed_slice(),
            rx_len: 0,
            rx_packets: 0,
            last_rx_seq: None,
            last_transfer_ok: false,
            had_reset: false,
            stats: TransferStats::default(),
        }
    }

    /// Queue a packet for the next transfer. `BufferFull` means "defer to
    /// the next cycle", nothing was written.
    pub fn write_packet(&mut self, request: &Request, id: u16) -> CodecResult<()> {
        self.tx.push(request, id)
    }

    /// Free payload bytes left in the transmit buffer this cycle.
    pub fn tx_remaining(&self) -> usize {
        self.tx.remaining()
    }

    pub fn tx_is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Payload received by the most recent successful transfer.
    pub fn rx_payload(&self) -> &[u8] {
        &self.rx_buf[..self.rx_len]
    }

    pub fn rx_packet_count(&self) -> u8 {
        self.rx_packets
    }

    /// True once a firmware reset has been detected; latched until
    /// [`clear_reset`](Self::clear_reset).
    pub fn had_reset(&self) -> bool {
        self.had_reset
    }

    pub fn clear_reset(&mut self) {
        self.had_reset = false;
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Run one complete transfer cycle.
    pub fn perform_full_transfer(&mut self) -> Result<TransferOutcome> {
        match self.run_exchange() {
            Ok(Cycle::Complete(header)) => {
                self.last_rx_seq = Some(header.sequence_number);
                self.last_transfer_ok = true;
                self.tx_seq = self.tx_seq.wrapping_add(1);
                self.tx.clear();
                self.stats.transfers += 1;
                trace!(
                    seq = header.sequence_number,
                    packets = header.num_packets,
                    bytes = header.data_length,
                    "transfer complete"
                );
                Ok(TransferOutcome::Success)
            }
            Ok(Cycle::Reset) => {
                self.note_reset();
                Ok(TransferOutcome::PeerReset)
            }
            Err(err) => {
                self.last_transfer_ok = false;
                Err(err)
            }
        }
    }

    fn run_exchange(&mut self) -> Result<Cycle> {
        let tx_header = TransferHeader::for_payload(
            self.tx.packet_count(),
            self.tx_seq,
            self.tx.as_slice(),
        )
        .to_wire();

        let mut retries = 0u32;
        let mut rejected_version: Option<u16> = None;
        let mut step = Step::Header;

        loop {
            match step {
                Step::Header => {
                    self.await_ready()?;
                    let mut rx_raw = [0u8; TRANSFER_HEADER_SIZE];
                    self.link.exchange(&tx_header, &mut rx_raw)?;

                    let parsed = TransferHeader::parse(&rx_raw);
                    let verdict = match &parsed {
                        Ok(_) => ResponseCode::Success,
                        Err(err) => {
                            if let HeaderError::BadVersion(theirs) = err {
                                rejected_version = Some(*theirs);
                            }
                            warn!(?err, "rejecting received header");
                            (*err).into()
                        }
                    };
                    let their_verdict = self.exchange_response(verdict)?;

                    if their_verdict == ResponseCode::BadProtocolVersion {
                        return Ok(Cycle::Reset);
                    }

                    if let (Ok(header), ResponseCode::Success, ResponseCode::Success) =
                        (parsed, verdict, their_verdict)
                    {
                        if self.is_sequence_reset(header.sequence_number) {
                            debug!(
                                seq = header.sequence_number,
                                prev = ?self.last_rx_seq,
                                "sequence regression, peer reset"
                            );
                            return Ok(Cycle::Reset);
                        }
                        let clocked =
                            self.tx.len().max(header.data_length as usize);
                        step = if clocked > 0 {
                            Step::Payload(header)
                        } else {
                            Step::Done(header)
                        };
                        continue;
                    }

                    retries += 1;
                    self.stats.retries += 1;
                    if retries > self.config.max_retries {
                        if let Some(theirs) = rejected_version {
                            return Err(TransferError::VersionMismatch {
                                theirs,
                                ours: PROTOCOL_VERSION,
                            });
                        }
                        return Err(TransferError::RetriesExhausted {
                            phase: "header",
                            attempts: retries,
                        });
                    }
                    debug!(retries, ?verdict, ?their_verdict, "retrying header exchange");
                    std::thread::sleep(self.config.retry_backoff);
                }

                Step::Payload(header) => {
                    let rx_len = header.data_length as usize;
                    let clocked = self.tx.len().max(rx_len);

                    self.tx_scratch[..self.tx.len()].copy_from_slice(self.tx.as_slice());
                    self.tx_scratch[self.tx.len()..clocked].fill(0);

                    self.await_ready()?;
                    self.link
                        .exchange(&self.tx_scratch[..clocked], &mut self.rx_buf[..clocked])?;

                    let rx_ok =
                        crate::crc::checksum(&self.rx_buf[..rx_len]) == header.checksum_data;
                    let verdict = if rx_ok {
                        ResponseCode::Success
                    } else {
                        warn!(seq = header.sequence_number, "payload checksum mismatch");
                        ResponseCode::BadDataChecksum
                    };
                    let their_verdict = self.exchange_response(verdict)?;

                    if let (ResponseCode::Success, ResponseCode::Success) =
                        (verdict, their_verdict)
                    {
                        step = Step::Done(header);
                        continue;
                    }
                    if their_verdict == ResponseCode::BadProtocolVersion {
                        return Ok(Cycle::Reset);
                    }

                    retries += 1;
                    self.stats.retries += 1;
                    if retries > self.config.max_retries {
                        return Err(TransferError::RetriesExhausted {
                            phase: "payload",
                            attempts: retries,
                        });
                    }

                    // A header-level complaint during the data phase means
                    // the peer lost our header; start the transfer over.
                    // Data-level complaints retry the payload alone.
                    if matches!(
                        their_verdict,
                        ResponseCode::BadHeaderChecksum | ResponseCode::BadFormat
                    ) {
                        debug!(retries, "header rejected during data phase, restarting");
                        step = Step::Header;
                    } else {
                        debug!(retries, ?verdict, ?their_verdict, "retrying payload exchange");
                    }
                    std::thread::sleep(self.config.retry_backoff);
                }

                Step::Done(header) => {
                    self.rx_len = header.data_length as usize;
                    self.rx_packets = header.num_packets;
                    return Ok(Cycle::Complete(header));
                }
            }
        }
    }

    /// Sequence regression after a completed transfer means the firmware
    /// restarted (invariant: rx sequence numbers advance by exactly 1).
    fn is_sequence_reset(&self, seq: u16) -> bool {
        match self.last_rx_seq {
            Some(prev) if self.last_transfer_ok => seq != prev.wrapping_add(1),
            _ => false,
        }
    }

    fn note_reset(&mut self) {
        self.had_reset = true;
        self.stats.resets += 1;
        self.tx_seq = 0;
        self.last_rx_seq = None;
        self.last_transfer_ok = false;
        self.rx_len = 0;
        self.rx_packets = 0;
        self.tx.clear();
        warn!("firmware reset detected, transfer state dropped");
    }

    fn await_ready(&mut self) -> Result<()> {
        for _ in 0..self.config.max_ready_waits {
            if self.link.wait_ready(self.config.ready_timeout)? {
                return Ok(());
            }
            self.stats.stalls += 1;
            warn!("transfer-ready wait timed out");
        }
        Err(TransferError::NotReady {
            attempts: self.config.max_ready_waits,
            timeout_ms: self.config.ready_timeout.as_millis() as u64,
        })
    }

    fn exchange_response(&mut self, verdict: ResponseCode) -> Result<ResponseCode> {
        self.await_ready()?;
        let tx = verdict.to_wire();
        let mut rx = [0u8; RESPONSE_SIZE];
        self.link.exchange(&tx, &mut rx)?;
        Ok(ResponseCode::from_wire(rx))
    }
}
