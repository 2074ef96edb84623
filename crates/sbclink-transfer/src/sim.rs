//! An in-process firmware stand-in.
//!
//! [`SimulatedPeer`] speaks the real transfer protocol behind the same
//! [`SpiBus`]/[`ReadyLine`] traits as the hardware: it exchanges headers,
//! verifies checksums, acknowledges codes with OK replies and answers lock
//! and object-model requests. The daemon's `--no-spi` mode runs against it,
//! and the link tests drive whole scenarios through it by injecting
//! firmware packets via [`SimHandle`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;

use sbclink_packet::{
    CodeChannel, PacketHeader, ReplyFlags, RequestKind, Response, PACKET_HEADER_SIZE,
};
use sbclink_spi::{ReadyLine, Result as SpiResult, SpiBus, TransportError};

use crate::crc;
use crate::header::{
    ResponseCode, TransferHeader, MAX_PAYLOAD, RESPONSE_SIZE, TRANSFER_HEADER_SIZE,
};

const CANNED_OBJECT_MODEL: &str = r#"{"state":{"status":"idle"},"boards":[{"firmwareVersion":"sim"}]}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimStep {
    AwaitHeader,
    AwaitHeaderResp,
    AwaitPayload,
    AwaitPayloadResp,
}

struct SimState {
    step: SimStep,
    seq: u16,
    /// Packets waiting for a future transfer.
    pending: VecDeque<Vec<u8>>,
    /// Payload committed to the transfer in progress.
    outbound: BytesMut,
    outbound_packets: u8,
    /// Host header fields captured during the header exchange.
    host_data_length: usize,
    host_data_checksum: u32,
    our_header_verdict: ResponseCode,
    our_payload_verdict: ResponseCode,
    /// Every code id the sim has acknowledged, for test assertions.
    acked_codes: Vec<u16>,
}

impl SimState {
    fn new() -> Self {
        Self {
            step: SimStep::AwaitHeader,
            seq: 0,
            pending: VecDeque::new(),
            outbound: BytesMut::with_capacity(MAX_PAYLOAD),
            outbound_packets: 0,
            host_data_length: 0,
            host_data_checksum: 0,
            our_header_verdict: ResponseCode::Success,
            our_payload_verdict: ResponseCode::Success,
            acked_codes: Vec::new(),
        }
    }

    fn queue_response(&mut self, response: &Response, id: u16) {
        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + response.body_len());
        PacketHeader::new(response.kind() as u16, id, response.body_len() as u16)
            .encode(&mut packet);
        response.encode_body(&mut packet);
        self.pending.push_back(packet);
    }

    /// Move queued packets into the outbound payload for this transfer.
    fn commit_outbound(&mut self) {
        if !self.outbound.is_empty() {
            // Retransmit of the transfer in progress; keep it as committed.
            return;
        }
        self.outbound_packets = 0;
        while let Some(front) = self.pending.front() {
            if self.outbound.len() + front.len() > MAX_PAYLOAD {
                break;
            }
            let packet = self
                .pending
                .pop_front()
                .unwrap_or_default();
            self.outbound.extend_from_slice(&packet);
            self.outbound_packets += 1;
        }
    }

    fn complete_transfer(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.outbound.clear();
        self.outbound_packets = 0;
        self.step = SimStep::AwaitHeader;
    }

    /// React to the packets the host sent this transfer.
    fn process_host_payload(&mut self, payload: &[u8]) {
        let mut rest = payload;
        while rest.len() >= PACKET_HEADER_SIZE {
            let mut cursor = rest;
            let Ok(header) = PacketHeader::decode(&mut cursor) else {
                return;
            };
            let body_len = header.length as usize;
            let padded = (body_len + 3) & !3;
            if padded > cursor.len() {
                return;
            }
            let body = &cursor[..body_len];
            rest = &cursor[padded..];
            self.handle_request(header, body);
        }
    }

    fn handle_request(&mut self, header: PacketHeader, body: &[u8]) {
        match header.request {
            r if r == RequestKind::Code as u16 => {
                let channel = CodeChannel::from_u8(body.first().copied().unwrap_or(0));
                self.acked_codes.push(header.id);
                self.queue_response(
                    &Response::CodeReply {
                        flags: ReplyFlags::for_channel(channel),
                        content: "ok".into(),
                    },
                    header.id,
                );
            }
            r if r == RequestKind::LockMovementAndWaitForStandstill as u16 => {
                let channel = CodeChannel::from_u8(body.first().copied().unwrap_or(0));
                self.queue_response(&Response::ResourceLocked { channel }, 0);
            }
            r if r == RequestKind::GetObjectModel as u16 => {
                self.queue_response(
                    &Response::ObjectModel {
                        data: CANNED_OBJECT_MODEL.into(),
                    },
                    header.id,
                );
            }
            r if r == RequestKind::EvaluateExpression as u16 => {
                let channel = CodeChannel::from_u8(body.first().copied().unwrap_or(0));
                self.queue_response(
                    &Response::EvaluationResult {
                        channel,
                        error: false,
                        value: "0".into(),
                    },
                    header.id,
                );
            }
            r if r == RequestKind::ResetAll as u16 => {
                self.pending.clear();
            }
            _ => {}
        }
    }
}

/// Injection/diagnostics handle for a [`SimulatedPeer`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Queue a firmware packet for the next transfer.
    pub fn inject(&self, response: &Response, id: u16) {
        if let Ok(mut state) = self.state.lock() {
            state.queue_response(response, id);
        }
    }

    /// Simulate a firmware reboot: sequence numbers and queues reset.
    pub fn reboot(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = SimState::new();
        }
    }

    /// Ids of all codes acknowledged so far.
    pub fn acked_codes(&self) -> Vec<u16> {
        self.state
            .lock()
            .map(|s| s.acked_codes.clone())
            .unwrap_or_default()
    }
}

/// The device half; hand this to [`DataTransfer`](crate::DataTransfer).
pub struct SimulatedPeer {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPeer {
    pub fn new() -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::new()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }

    fn lock(&self) -> SpiResult<std::sync::MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::Io(std::io::Error::other("simulated peer poisoned")))
    }
}

impl SpiBus for SimulatedPeer {
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> SpiResult<()> {
        let mut state = self.lock()?;

        // A header-sized exchange in any later step means the host abandoned
        // the transfer in progress (e.g. it just detected our reboot) and is
        // starting over; committed outbound data stays queued for resend.
        if rx.len() == TRANSFER_HEADER_SIZE && state.step != SimStep::AwaitHeader {
            let expecting_header_sized_payload = state.step == SimStep::AwaitPayload
                && state.host_data_length.max(state.outbound.len()) == TRANSFER_HEADER_SIZE;
            if !expecting_header_sized_payload {
                state.step = SimStep::AwaitHeader;
            }
        }

        match (state.step, rx.len()) {
            (SimStep::AwaitHeader, TRANSFER_HEADER_SIZE) => {
                let mut raw = [0u8; TRANSFER_HEADER_SIZE];
                raw.copy_from_slice(tx);
                match TransferHeader::parse(&raw) {
                    Ok(header) => {
                        state.host_data_length = header.data_length as usize;
                        state.host_data_checksum = header.checksum_data;
                        state.our_header_verdict = ResponseCode::Success;
                    }
                    Err(err) => {
                        state.our_header_verdict = err.into();
                    }
                }

                state.commit_outbound();
                let header = TransferHeader::for_payload(
                    state.outbound_packets,
                    state.seq,
                    &state.outbound,
                );
                rx.copy_from_slice(&header.to_wire());
                state.step = SimStep::AwaitHeaderResp;
                Ok(())
            }

            (SimStep::AwaitHeaderResp, RESPONSE_SIZE) => {
                let mut raw = [0u8; RESPONSE_SIZE];
                raw.copy_from_slice(tx);
                let host_verdict = ResponseCode::from_wire(raw);
                rx.copy_from_slice(&state.our_header_verdict.to_wire());

                let both_ok = host_verdict == ResponseCode::Success
                    && state.our_header_verdict == ResponseCode::Success;
                if !both_ok {
                    state.step = SimStep::AwaitHeader;
                } else if state.host_data_length.max(state.outbound.len()) > 0 {
                    state.step = SimStep::AwaitPayload;
                } else {
                    state.complete_transfer();
                }
                Ok(())
            }

            (SimStep::AwaitPayload, _) => {
                let host_len = state.host_data_length;
                let Some(host_payload) = tx.get(..host_len).map(<[u8]>::to_vec) else {
                    return Err(TransportError::Io(std::io::Error::other(
                        "payload exchange shorter than the declared host length",
                    )));
                };
                state.our_payload_verdict =
                    if crc::checksum(&host_payload) == state.host_data_checksum {
                        ResponseCode::Success
                    } else {
                        ResponseCode::BadDataChecksum
                    };

                rx.fill(0);
                let out_len = state.outbound.len();
                rx[..out_len].copy_from_slice(&state.outbound);
                state.step = SimStep::AwaitPayloadResp;

                if state.our_payload_verdict == ResponseCode::Success {
                    state.process_host_payload(&host_payload);
                }
                Ok(())
            }

            (SimStep::AwaitPayloadResp, RESPONSE_SIZE) => {
                let mut raw = [0u8; RESPONSE_SIZE];
                raw.copy_from_slice(tx);
                let host_verdict = ResponseCode::from_wire(raw);
                rx.copy_from_slice(&state.our_payload_verdict.to_wire());

                if host_verdict == ResponseCode::Success
                    && state.our_payload_verdict == ResponseCode::Success
                {
                    state.complete_transfer();
                } else {
                    state.step = SimStep::AwaitPayload;
                }
                Ok(())
            }

            (step, len) => Err(TransportError::Io(std::io::Error::other(format!(
                "unexpected {len}-byte exchange in {step:?}"
            )))),
        }
    }
}

impl ReadyLine for SimulatedPeer {
    fn wait_ready(&mut self, _timeout: Duration) -> SpiResult<bool> {
        Ok(true)
    }
}
