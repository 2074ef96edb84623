//! Shared channel storage and the producer-facing handle.
//!
//! The Processor owns the transfer; channels are shared between the
//! Processor task and producer threads (IPC handlers, the macro feeder).
//! Every channel is its own critical section, and hold times are bounded
//! to queue operations. Producers never receive references into the
//! Processor; everything flows through [`LinkHandle`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use sbclink_packet::{Code, CodeChannel, Request};

use crate::channel::{Channel, ChannelStats};
use crate::state::CodeResult;
use crate::waiter::Waiter;

/// Fixed array of channels, addressed by index only.
pub struct ChannelSet {
    channels: Vec<Mutex<Channel>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self {
            channels: CodeChannel::ALL
                .into_iter()
                .map(|channel| Mutex::new(Channel::new(channel)))
                .collect(),
        }
    }

    /// Run `f` inside the channel's critical section.
    pub fn with<R>(&self, channel: CodeChannel, f: impl FnOnce(&mut Channel) -> R) -> R {
        let mut guard = lock_channel(&self.channels[channel.index()]);
        f(&mut guard)
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        CodeChannel::ALL
            .into_iter()
            .map(|channel| self.with(channel, |c| c.stats()))
            .collect()
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_channel(mutex: &Mutex<Channel>) -> MutexGuard<'_, Channel> {
    match mutex.lock() {
        Ok(guard) => guard,
        // A panicked producer cannot corrupt queue invariants that matter
        // past its own waiters; carry on with the channel.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Link-wide diagnostics snapshot served over IPC.
#[derive(Debug, Clone, Serialize)]
pub struct LinkDiagnostics {
    pub transfers: u64,
    pub retries: u64,
    pub stalls: u64,
    pub resets: u64,
    pub buffer_space: u16,
    pub connected: bool,
    pub channels: Vec<ChannelStats>,
}

/// Transfer-side numbers published by the Processor after each cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferSnapshot {
    pub transfers: u64,
    pub retries: u64,
    pub stalls: u64,
    pub resets: u64,
    pub buffer_space: u16,
    pub connected: bool,
}

pub(crate) struct Shared {
    pub(crate) channels: ChannelSet,
    pub(crate) snapshot: Mutex<TransferSnapshot>,
    /// Host-initiated packets outside any channel (object-model writes,
    /// print lifecycle, file chunks). Drained ahead of channel traffic.
    pub(crate) outbound: Mutex<VecDeque<(Request, u16)>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            channels: ChannelSet::new(),
            snapshot: Mutex::new(TransferSnapshot::default()),
            outbound: Mutex::new(VecDeque::new()),
        }
    }
}

/// Cloneable producer API over the shared link state.
#[derive(Clone)]
pub struct LinkHandle {
    pub(crate) shared: Arc<Shared>,
}

impl LinkHandle {
    /// Queue a code on its channel; the waiter resolves with the reply.
    pub fn push_code(&self, code: Code) -> Waiter<CodeResult> {
        let channel = code.channel;
        self.shared.channels.with(channel, |c| c.push(code))
    }

    /// Await drain of everything queued on the channel so far.
    pub fn flush(&self, channel: CodeChannel, sync_file_streams: bool) -> Waiter<bool> {
        self.shared
            .channels
            .with(channel, |c| c.flush(sync_file_streams))
    }

    pub fn lock(&self, channel: CodeChannel) -> Waiter<()> {
        self.shared.channels.with(channel, |c| c.lock())
    }

    pub fn unlock(&self, channel: CodeChannel) -> Waiter<()> {
        self.shared.channels.with(channel, |c| c.unlock())
    }

    /// Acknowledge a blocking message prompt on the channel.
    pub fn acknowledge(&self, channel: CodeChannel) {
        self.shared.channels.with(channel, |c| c.acknowledge());
    }

    /// The macro feeder finished (or failed) the topmost macro.
    pub fn macro_finished(&self, channel: CodeChannel, success: bool) {
        self.shared
            .channels
            .with(channel, |c| c.macro_finished(success));
    }

    /// Queue a host-initiated packet outside any channel, e.g.
    /// `SetObjectModelValue` or a `FileChunk` answer.
    pub fn send_request(&self, request: Request) {
        if let Ok(mut outbound) = self.shared.outbound.lock() {
            outbound.push_back((request, 0));
        }
    }

    pub fn diagnostics(&self) -> LinkDiagnostics {
        let snapshot = self
            .shared
            .snapshot
            .lock()
            .map(|s| *s)
            .unwrap_or_default();
        LinkDiagnostics {
            transfers: snapshot.transfers,
            retries: snapshot.retries,
            stalls: snapshot.stalls,
            resets: snapshot.resets,
            buffer_space: snapshot.buffer_space,
            connected: snapshot.connected,
            channels: self.shared.channels.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_routes_by_code_channel() {
        let shared = Arc::new(Shared::new());
        let handle = LinkHandle {
            shared: Arc::clone(&shared),
        };

        let code = sbclink_packet::parse("G28", CodeChannel::Telnet).unwrap();
        let waiter = handle.push_code(code);

        let stats = handle.diagnostics();
        let telnet = &stats.channels[CodeChannel::Telnet.index()];
        assert_eq!(telnet.pending, 1);
        assert_eq!(stats.channels[CodeChannel::Http.index()].pending, 0);

        waiter.cancel();
    }

    #[test]
    fn send_request_queues_outbound() {
        let shared = Arc::new(Shared::new());
        let handle = LinkHandle {
            shared: Arc::clone(&shared),
        };

        handle.send_request(Request::PrintStopped {
            reason: sbclink_packet::PrintStopReason::NormalCompletion,
        });
        let queued = shared.outbound.lock().unwrap().len();
        assert_eq!(queued, 1);
    }
}
