//! The single owner of the transfer loop.
//!
//! One task drives the SPI bus: perform a transfer, route every received
//! packet, then refill the transmit buffer from the channels under a byte
//! budget. Producers only ever touch channel queues through [`LinkHandle`];
//! every waiter is resolved from here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use sbclink_packet::{
    packet_wire_len, CodeChannel, PacketReader, ReplyFlags, Request, Response, CHANNEL_COUNT,
};
use sbclink_spi::{ReadyLine, SpiBus};
use sbclink_transfer::{DataTransfer, TransferError, TransferOutcome};

use crate::channels::{LinkHandle, Shared};
use crate::error::LinkError;
use crate::sink::EventSink;

/// Processor tunables.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How long startup may spend establishing the link.
    pub connect_timeout: Duration,
    /// Payload bytes kept free for priority packets each cycle.
    pub priority_headroom: usize,
    /// Pause after a cycle that moved nothing, to keep idle polling tame.
    pub idle_pause: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            priority_headroom: 64,
            idle_pause: Duration::from_millis(2),
        }
    }
}

pub struct Processor<L> {
    transfer: DataTransfer<L>,
    shared: Arc<Shared>,
    sink: Box<dyn EventSink>,
    shutdown: Arc<AtomicBool>,
    config: ProcessorConfig,
    rr_next: usize,
}

impl<L: SpiBus + ReadyLine> Processor<L> {
    pub fn new(transfer: DataTransfer<L>, sink: Box<dyn EventSink>) -> Self {
        Self::with_config(transfer, sink, ProcessorConfig::default())
    }

    pub fn with_config(
        transfer: DataTransfer<L>,
        sink: Box<dyn EventSink>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            transfer,
            shared: Arc::new(Shared::new()),
            sink,
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
            rr_next: 0,
        }
    }

    /// The producer-facing handle; clone freely.
    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Setting this stops [`run`](Self::run) after the current cycle.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Establish the link: empty transfers until the firmware's header is
    /// accepted, with exponential backoff up to the startup deadline.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut backoff = Duration::from_millis(50);
        let mut last_versions: Option<(u16, u16)> = None;

        loop {
            match self.transfer.perform_full_transfer() {
                Ok(_) => {
                    info!("link to firmware established");
                    self.request_model_update();
                    self.publish_snapshot(true);
                    return Ok(());
                }
                Err(TransferError::VersionMismatch { theirs, ours }) => {
                    last_versions = Some((theirs, ours));
                    warn!(theirs, ours, "firmware protocol version mismatch");
                }
                Err(err) => {
                    warn!(%err, "link attempt failed");
                }
            }

            if Instant::now() >= deadline {
                return Err(match last_versions {
                    Some((theirs, ours)) => LinkError::IncompatibleFirmware { theirs, ours },
                    None => LinkError::ConnectTimeout(self.config.connect_timeout),
                });
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    /// Drive transfers until the shutdown flag is set.
    pub fn run(&mut self) -> Result<(), LinkError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            self.run_cycle()?;
        }
        self.finish();
        Ok(())
    }

    /// One transfer cycle: exchange, route, refill.
    pub fn run_cycle(&mut self) -> Result<TransferOutcome, LinkError> {
        match self.transfer.perform_full_transfer() {
            Ok(TransferOutcome::Success) => {
                self.commit_channels();
                let routed = self.route_rx();
                self.fill_tx();
                self.publish_snapshot(true);
                if routed == 0 && self.transfer.tx_is_empty() {
                    std::thread::sleep(self.config.idle_pause);
                }
                Ok(TransferOutcome::Success)
            }
            Ok(TransferOutcome::PeerReset) => {
                self.handle_reset();
                Ok(TransferOutcome::PeerReset)
            }
            Err(err) => {
                error!(%err, "transfer failed fatally");
                self.publish_snapshot(false);
                Err(err.into())
            }
        }
    }

    /// The previous cycle's packets were delivered; let channels resolve
    /// whatever was waiting on that delivery.
    fn commit_channels(&mut self) {
        for channel in CodeChannel::ALL {
            self.shared.channels.with(channel, |c| c.commit_sent());
        }
    }

    fn route_rx(&self) -> usize {
        let mut routed = 0usize;
        for item in PacketReader::new(self.transfer.rx_payload()) {
            let (header, response) = match item {
                Ok(packet) => packet,
                Err(err) => {
                    // The transport checksum passed but the payload does not
                    // parse; drop the rest of it and let retries resync.
                    warn!(%err, "corrupt payload content");
                    break;
                }
            };
            routed += 1;
            self.route(header.id, response);
        }
        routed
    }

    fn route(&self, id: u16, response: Response) {
        match response {
            Response::ObjectModel { data } => self.sink.object_model(&data),
            Response::Message { flags, content } => self.sink.message(flags, &content),
            Response::CodeReply { flags, content } => {
                let mut delivered = false;
                for channel in flags.channels() {
                    delivered = true;
                    let result = self
                        .shared
                        .channels
                        .with(channel, |c| c.on_reply(id, flags, &content));
                    match result {
                        Ok(crate::channel::ReplyDisposition::NoCodeInFlight) => {
                            self.sink.message(flags, &content);
                        }
                        Ok(_) => {}
                        Err(err) => error!(%err, "code reply rejected"),
                    }
                }
                if !delivered {
                    self.sink.message(ReplyFlags::default(), &content);
                }
            }
            Response::ExecuteMacro {
                channel,
                report_missing,
                from_code,
                filename,
            } => {
                self.shared
                    .channels
                    .with(channel, |c| c.on_execute_macro(&filename, from_code));
                self.sink
                    .macro_requested(channel, &filename, report_missing, from_code);
            }
            Response::AbortFile { channel, abort_all } => {
                self.shared
                    .channels
                    .with(channel, |c| c.on_abort(abort_all));
            }
            Response::ResourceLocked { channel } => {
                self.shared
                    .channels
                    .with(channel, |c| c.on_resource_locked());
            }
            Response::CodeBufferUpdate { buffer_space } => {
                if let Ok(mut snapshot) = self.shared.snapshot.lock() {
                    snapshot.buffer_space = buffer_space;
                }
            }
            Response::PrintPaused {
                file_position,
                reason,
            } => self.sink.print_paused(file_position, reason),
            Response::FileChunkRequest {
                offset,
                max_length,
                filename,
            } => self.sink.file_chunk_requested(&filename, offset, max_length),
            Response::EvaluationResult {
                channel,
                error,
                value,
            } => self.sink.evaluation_result(channel, error, &value),
            Response::DoCode { channel, code } => self.sink.do_code(channel, &code),
        }
    }

    fn fill_tx(&mut self) {
        // Host-initiated packets and channel housekeeping first; these may
        // use the whole buffer, including the headroom.
        self.drain_outbound();
        for channel in CodeChannel::ALL {
            loop {
                let budget = self.transfer.tx_remaining();
                let next = self
                    .shared
                    .channels
                    .with(channel, |c| c.next_priority_request(budget));
                let Some((request, id)) = next else { break };
                if self.transfer.write_packet(&request, id).is_err() {
                    break;
                }
            }
        }

        // Codes run under the remaining budget minus the headroom, in
        // round-robin order; channels blocked on a start code go first.
        let mut budget = self
            .transfer
            .tx_remaining()
            .saturating_sub(self.config.priority_headroom);
        for channel in self.code_service_order() {
            while budget > 0 {
                let next = self
                    .shared
                    .channels
                    .with(channel, |c| c.next_code_request(budget));
                let Some((request, id)) = next else { break };
                let len = packet_wire_len(&request);
                if self.transfer.write_packet(&request, id).is_err() {
                    budget = 0;
                    break;
                }
                debug!(channel = %channel, id, "code queued for transfer");
                budget = budget.saturating_sub(len);
            }
        }
        self.rr_next = (self.rr_next + 1) % CHANNEL_COUNT;
    }

    fn drain_outbound(&mut self) {
        loop {
            let next = self
                .shared
                .outbound
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front());
            let Some((request, id)) = next else { break };
            if packet_wire_len(&request) > self.transfer.tx_remaining() {
                // Does not fit this cycle; put it back for the next one.
                if let Ok(mut q) = self.shared.outbound.lock() {
                    q.push_front((request, id));
                }
                break;
            }
            if self.transfer.write_packet(&request, id).is_err() {
                break;
            }
        }
    }

    /// Round-robin order rotated per cycle, start-code channels first.
    fn code_service_order(&self) -> Vec<CodeChannel> {
        let mut order: Vec<CodeChannel> = (0..CHANNEL_COUNT)
            .map(|i| CodeChannel::ALL[(self.rr_next + i) % CHANNEL_COUNT])
            .collect();
        order.sort_by_key(|channel| {
            !self
                .shared
                .channels
                .with(*channel, |c| c.start_code_outstanding())
        });
        order
    }

    fn handle_reset(&mut self) {
        warn!("firmware reset: invalidating all channels");
        for channel in CodeChannel::ALL {
            self.shared.channels.with(channel, |c| c.invalidate());
        }
        if let Ok(mut outbound) = self.shared.outbound.lock() {
            outbound.clear();
        }
        self.sink.firmware_reset();
        self.transfer.clear_reset();
        self.request_model_update();
        self.publish_snapshot(true);
    }

    /// Prime the object-model mirror with a full refresh.
    fn request_model_update(&mut self) {
        let request = Request::GetObjectModel {
            key: String::new(),
            flags: "d99f".into(),
        };
        if self.transfer.write_packet(&request, 0).is_err() {
            debug!("object-model refresh deferred, buffer full");
        }
    }

    fn publish_snapshot(&self, connected: bool) {
        let stats = self.transfer.stats();
        if let Ok(mut snapshot) = self.shared.snapshot.lock() {
            snapshot.transfers = stats.transfers;
            snapshot.retries = stats.retries;
            snapshot.stalls = stats.stalls;
            snapshot.resets = stats.resets;
            snapshot.connected = connected;
        }
    }

    /// Cancel outstanding work and tell the firmware to drop its state.
    fn finish(&mut self) {
        info!("shutting down link");
        for channel in CodeChannel::ALL {
            self.shared.channels.with(channel, |c| c.invalidate());
        }
        if self.transfer.write_packet(&Request::ResetAll, 0).is_ok() {
            if let Err(err) = self.transfer.perform_full_transfer() {
                warn!(%err, "final reset transfer failed");
            }
        }
        self.publish_snapshot(false);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sbclink_packet::{parse, PauseReason};
    use sbclink_transfer::{SimHandle, SimulatedPeer};

    use super::*;
    use crate::sink::NullSink;
    use crate::state::CodeResult;
    use crate::waiter::Outcome;

    #[derive(Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl EventSink for RecordingSink {
        fn object_model(&self, data: &str) {
            self.record(format!("model:{data}"));
        }
        fn message(&self, _flags: ReplyFlags, content: &str) {
            self.record(format!("message:{content}"));
        }
        fn macro_requested(
            &self,
            channel: CodeChannel,
            filename: &str,
            _report_missing: bool,
            _from_code: bool,
        ) {
            self.record(format!("macro:{channel}:{filename}"));
        }
        fn print_paused(&self, file_position: u32, _reason: PauseReason) {
            self.record(format!("paused:{file_position}"));
        }
        fn firmware_reset(&self) {
            self.record("reset".into());
        }
    }

    impl RecordingSink {
        fn record(&self, event: String) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }

    fn sim_processor() -> (Processor<SimulatedPeer>, SimHandle, Arc<Mutex<Vec<String>>>) {
        let (peer, sim) = SimulatedPeer::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            events: Arc::clone(&events),
        };
        let processor = Processor::new(DataTransfer::new(peer), Box::new(sink));
        (processor, sim, events)
    }

    fn cycles(processor: &mut Processor<SimulatedPeer>, count: usize) {
        for _ in 0..count {
            processor.run_cycle().expect("cycle should succeed");
        }
    }

    #[test]
    fn connect_succeeds_against_simulator() {
        let (peer, _sim) = SimulatedPeer::new();
        let mut processor = Processor::new(DataTransfer::new(peer), Box::new(NullSink));
        processor.connect().unwrap();
        assert!(processor.handle().diagnostics().connected);
    }

    #[test]
    fn pushed_code_completes_end_to_end() {
        let (mut processor, _sim, _events) = sim_processor();
        let handle = processor.handle();

        let waiter = handle.push_code(parse("G28", CodeChannel::Http).unwrap());
        cycles(&mut processor, 3);

        assert_eq!(
            waiter.wait(),
            Outcome::Completed(CodeResult {
                reply: "ok".into(),
                success: true
            })
        );
        let diagnostics = handle.diagnostics();
        let http = &diagnostics.channels[CodeChannel::Http.index()];
        assert_eq!(http.total_completed, 1);
        assert_eq!(http.in_flight, 0);
    }

    #[test]
    fn lock_round_trip() {
        let (mut processor, _sim, _events) = sim_processor();
        let handle = processor.handle();

        let lock = handle.lock(CodeChannel::File);
        cycles(&mut processor, 3);
        assert_eq!(lock.wait(), Outcome::Completed(()));
    }

    #[test]
    fn flush_round_trip() {
        let (mut processor, _sim, _events) = sim_processor();
        let handle = processor.handle();

        let w = handle.push_code(parse("G1 X5", CodeChannel::Usb).unwrap());
        let flush = handle.flush(CodeChannel::Usb, true);
        cycles(&mut processor, 4);

        assert!(matches!(w.wait(), Outcome::Completed(_)));
        assert_eq!(flush.wait(), Outcome::Completed(true));
    }

    #[test]
    fn macro_request_routes_to_sink_and_pushes_frame() {
        let (mut processor, sim, events) = sim_processor();
        let handle = processor.handle();

        sim.inject(
            &Response::ExecuteMacro {
                channel: CodeChannel::File,
                report_missing: false,
                from_code: false,
                filename: "start.g".into(),
            },
            0,
        );
        cycles(&mut processor, 2);

        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == "macro:File:start.g"));
        assert_eq!(
            handle.diagnostics().channels[CodeChannel::File.index()].stack_depth,
            2
        );

        // The feeder signals EOF; the frame pops after the completion
        // packet is delivered.
        handle.macro_finished(CodeChannel::File, true);
        cycles(&mut processor, 2);
        assert_eq!(
            handle.diagnostics().channels[CodeChannel::File.index()].stack_depth,
            1
        );
    }

    #[test]
    fn firmware_reset_aborts_waiters_within_a_cycle() {
        let (mut processor, sim, events) = sim_processor();
        let handle = processor.handle();

        let waiter = handle.push_code(parse("G4 S60", CodeChannel::Daemon).unwrap());
        cycles(&mut processor, 1);

        sim.reboot();
        let outcome = processor.run_cycle().unwrap();
        assert_eq!(outcome, TransferOutcome::PeerReset);

        assert_eq!(waiter.wait(), Outcome::Aborted);
        assert!(events.lock().unwrap().iter().any(|e| e == "reset"));

        // The link keeps working after the reset.
        let waiter = handle.push_code(parse("G28", CodeChannel::Daemon).unwrap());
        cycles(&mut processor, 3);
        assert!(matches!(waiter.wait(), Outcome::Completed(_)));
    }

    #[test]
    fn object_model_patches_reach_the_sink() {
        let (mut processor, _sim, events) = sim_processor();
        let handle = processor.handle();

        handle.send_request(Request::GetObjectModel {
            key: "state".into(),
            flags: String::new(),
        });
        cycles(&mut processor, 3);

        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("model:")));
    }

    #[test]
    fn buffer_full_defers_codes_without_loss() {
        let (mut processor, sim, _events) = sim_processor();
        let handle = processor.handle();

        // Each of these is ~44 wire bytes; 200 of them cannot fit one
        // 2048-byte transfer.
        let waiters: Vec<_> = (0..200)
            .map(|i| {
                handle.push_code(
                    parse(&format!("G1 X{i} Y{i} F3000"), CodeChannel::Usb).unwrap(),
                )
            })
            .collect();

        let mut transfers_with_codes = 0;
        let mut acked_so_far = 0;
        for _ in 0..32 {
            processor.run_cycle().unwrap();
            let acked = sim.acked_codes().len();
            if acked > acked_so_far {
                transfers_with_codes += 1;
                acked_so_far = acked;
            }
            if acked == 200 {
                break;
            }
        }

        assert_eq!(sim.acked_codes().len(), 200, "no code may be dropped");
        assert!(
            transfers_with_codes >= 4,
            "200 codes cannot fit fewer than 4 transfers"
        );
        for waiter in waiters {
            assert!(matches!(waiter.wait(), Outcome::Completed(_)));
        }
    }
}
