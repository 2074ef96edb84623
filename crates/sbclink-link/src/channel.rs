//! The per-channel execution machine.
//!
//! Each channel owns a stack of execution frames and the waiters attached
//! to them. Invariants enforced here:
//!
//! - only the topmost frame hands codes down;
//! - a code id stays reserved until the firmware replied (or the channel
//!   discarded the code);
//! - within a frame, replies must arrive in hand-down order; anything else
//!   is a protocol violation that aborts this channel only;
//! - macro completion is signalled to the firmware at most once per frame.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use sbclink_packet::{packet_wire_len, Code, CodeChannel, ReplyFlags, Request};

use crate::error::LinkError;
use crate::state::{CodeResult, FlushRequest, InFlight, LockRequest, PendingCode, State};
use crate::waiter::{self, Waiter};

/// What became of a routed code reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Matched the oldest in-flight code of some frame.
    Consumed,
    /// Belonged to a code this channel discarded (aborted file).
    Discarded,
    /// Nothing was in flight; the content is a plain message.
    NoCodeInFlight,
}

/// Snapshot of one channel for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel: CodeChannel,
    pub stack_depth: usize,
    pub pending: usize,
    pub suspended: usize,
    pub in_flight: usize,
    pub flush_waiters: usize,
    pub lock_waiters: usize,
    pub total_pushed: u64,
    pub total_completed: u64,
    pub protocol_errors: u64,
}

pub struct Channel {
    channel: CodeChannel,
    stack: Vec<State>,
    /// Tickets of codes not yet resolved, for flush barriers.
    outstanding: BTreeSet<u64>,
    /// Ids of in-flight codes dropped with an aborted file; their late
    /// replies are swallowed instead of tripping the order check.
    discarded_ids: HashSet<u16>,
    next_ticket: u64,
    next_id: u16,
    /// A `MacroCompleted` packet is in the outgoing transfer.
    pending_pop: bool,
    /// An acknowledgement was requested / is in the outgoing transfer.
    ack_requested: bool,
    ack_sent: bool,
    total_pushed: u64,
    total_completed: u64,
    protocol_errors: u64,
}

impl Channel {
    pub fn new(channel: CodeChannel) -> Self {
        Self {
            channel,
            stack: vec![State::base()],
            outstanding: BTreeSet::new(),
            discarded_ids: HashSet::new(),
            next_ticket: 0,
            next_id: 0,
            pending_pop: false,
            ack_requested: false,
            ack_sent: false,
            total_pushed: 0,
            total_completed: 0,
            protocol_errors: 0,
        }
    }

    pub fn channel(&self) -> CodeChannel {
        self.channel
    }

    /// True while the topmost frame runs a macro.
    pub fn in_macro(&self) -> bool {
        self.top().is_macro()
    }

    /// The topmost frame's start code is still awaiting its reply.
    pub fn start_code_outstanding(&self) -> bool {
        self.top().start_code.is_some()
    }

    // ---- producer-facing operations -----------------------------------

    /// Queue a code on the topmost frame.
    pub fn push(&mut self, mut code: Code) -> Waiter<CodeResult> {
        code.channel = self.channel;
        code.from_macro = self.top().is_macro();

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.outstanding.insert(ticket);
        self.total_pushed += 1;

        let (waiter, completer) = waiter::pair();
        self.top_mut().pending_codes.push_back(PendingCode {
            code,
            ticket,
            completer,
        });
        waiter
    }

    /// Await drain of everything queued on this channel so far.
    pub fn flush(&mut self, sync_file_streams: bool) -> Waiter<bool> {
        let (waiter, completer) = waiter::pair();
        let barrier = self.next_ticket;
        self.top_mut().flush_requests.push_back(FlushRequest {
            barrier,
            sync_file_streams,
            completer,
        });
        waiter
    }

    /// Ask for the global movement lock.
    pub fn lock(&mut self) -> Waiter<()> {
        self.queue_lock(false)
    }

    /// Release previously acquired locks.
    pub fn unlock(&mut self) -> Waiter<()> {
        self.queue_lock(true)
    }

    fn queue_lock(&mut self, unlock: bool) -> Waiter<()> {
        let (waiter, completer) = waiter::pair();
        self.top_mut().lock_requests.push_back(LockRequest {
            unlock,
            sent: false,
            completer,
        });
        waiter
    }

    /// A blocking message prompt opened; stop handing codes down.
    pub fn await_acknowledgement(&mut self) {
        self.top_mut().waiting_for_acknowledgement = true;
    }

    /// The user acknowledged the prompt; an `Ack` packet goes out next.
    pub fn acknowledge(&mut self) {
        self.ack_requested = true;
    }

    /// The macro feeder reached EOF (or gave up) on the topmost frame.
    pub fn macro_finished(&mut self, success: bool) {
        match self.top_mut().macro_file.as_mut() {
            Some(macro_file) => {
                macro_file.finished = true;
                macro_file.failed = !success;
            }
            None => warn!(channel = %self.channel, "macro_finished on a frame without a macro"),
        }
    }

    // ---- firmware-driven callbacks ------------------------------------

    /// Route a code reply.
    ///
    /// The reply must match the oldest in-flight code of the closest frame
    /// to the top that has one; within a frame, replies arrive in hand-down
    /// order or the channel aborts.
    pub fn on_reply(
        &mut self,
        id: u16,
        flags: ReplyFlags,
        content: &str,
    ) -> Result<ReplyDisposition, LinkError> {
        if self.discarded_ids.remove(&id) {
            debug!(channel = %self.channel, id, "late reply for a discarded code");
            return Ok(ReplyDisposition::Discarded);
        }

        let Some(depth) = self
            .stack
            .iter()
            .rposition(|frame| !frame.in_flight.is_empty())
        else {
            return Ok(ReplyDisposition::NoCodeInFlight);
        };

        let front_id = match self.stack[depth].in_flight.front() {
            Some(front) => front.id,
            None => return Ok(ReplyDisposition::NoCodeInFlight),
        };
        if front_id != id {
            let reason = format!(
                "reply for code {id} arrived while code {front_id} was oldest in flight"
            );
            return Err(self.protocol_violation(reason));
        }

        let frame = &mut self.stack[depth];
        if let Some(front) = frame.in_flight.front_mut() {
            front.reply.push_str(content);
        }
        if flags.is_push() {
            // Partial reply; more content follows under the same id.
            return Ok(ReplyDisposition::Consumed);
        }

        if let Some(done) = frame.in_flight.pop_front() {
            self.outstanding.remove(&done.ticket);
            self.total_completed += 1;
            done.completer.complete(CodeResult {
                reply: done.reply,
                success: !flags.is_error(),
            });
        }
        self.check_flushes();
        Ok(ReplyDisposition::Consumed)
    }

    /// The firmware wants a macro run on this channel: push a frame.
    pub fn on_execute_macro(&mut self, filename: &str, from_code: bool) {
        let start_code = self
            .top()
            .in_flight
            .front()
            .map(|in_flight| in_flight.code.clone());
        self.top_mut().suspend();
        self.stack
            .push(State::for_macro(filename.to_owned(), from_code, start_code));
        debug!(
            channel = %self.channel,
            filename,
            depth = self.stack.len(),
            "macro frame pushed"
        );
    }

    /// The firmware granted the movement/resource lock.
    pub fn on_resource_locked(&mut self) {
        for frame in self.stack.iter_mut().rev() {
            let grantable = matches!(
                frame.lock_requests.front(),
                Some(front) if front.sent && !front.unlock
            );
            if grantable {
                if let Some(granted) = frame.lock_requests.pop_front() {
                    granted.completer.complete(());
                }
                return;
            }
        }
        warn!(channel = %self.channel, "ResourceLocked without an outstanding lock request");
    }

    /// The firmware aborted the file(s) on this channel.
    ///
    /// Macro frames pop without `MacroCompleted`: the firmware killed the
    /// file, there is nothing left to complete. Base in-flight codes keep
    /// waiting; their replies still arrive.
    pub fn on_abort(&mut self, abort_all: bool) {
        self.pending_pop = false;
        while self.stack.len() > 1 {
            if let Some(frame) = self.stack.pop() {
                self.abort_frame(frame, true);
            }
            if !abort_all {
                break;
            }
        }
        if abort_all {
            let mut base = match self.stack.first_mut() {
                Some(base) => std::mem::take(base),
                None => State::base(),
            };
            let mut fresh = State::base();
            fresh.in_flight = std::mem::take(&mut base.in_flight);
            let kept_in_flight = fresh.in_flight.len();
            self.abort_frame(base, false);
            self.stack[0] = fresh;
            debug!(channel = %self.channel, kept_in_flight, "aborted all files");
        }
        self.top_mut().resume();
        self.check_flushes();
    }

    /// Resolve every waiter with *aborted* and pop back to a fresh base
    /// frame. Driven by firmware reset or emergency stop.
    pub fn invalidate(&mut self) {
        while let Some(frame) = self.stack.pop() {
            abort_frame_contents(frame);
        }
        self.outstanding.clear();
        self.discarded_ids.clear();
        self.stack.push(State::base());
        self.next_id = 0;
        self.pending_pop = false;
        self.ack_requested = false;
        self.ack_sent = false;
    }

    // ---- processor-facing scheduling ----------------------------------

    /// Next housekeeping packet (macro completion, ack, lock/unlock), if it
    /// fits in `budget` bytes. These bypass the code budget.
    pub fn next_priority_request(&mut self, budget: usize) -> Option<(Request, u16)> {
        if self.macro_completion_due() {
            let failed = self.top().macro_file.as_ref().is_some_and(|m| m.failed);
            let request = Request::MacroCompleted {
                channel: self.channel as u8,
                error: failed,
            };
            if packet_wire_len(&request) <= budget {
                self.top_mut().macro_completed = true;
                self.pending_pop = true;
                return Some((request, 0));
            }
            return None;
        }

        if self.ack_requested && !self.ack_sent {
            let request = Request::Ack {
                channel: self.channel as u8,
            };
            if packet_wire_len(&request) <= budget {
                self.ack_sent = true;
                return Some((request, 0));
            }
            return None;
        }

        let channel = self.channel as u8;
        if let Some(front) = self.top_mut().lock_requests.front_mut() {
            if !front.sent {
                let request = if front.unlock {
                    Request::Unlock { channel }
                } else {
                    Request::LockMovementAndWaitForStandstill { channel }
                };
                if packet_wire_len(&request) <= budget {
                    front.sent = true;
                    return Some((request, 0));
                }
            }
        }
        None
    }

    /// Next code for the firmware, if the topmost frame may send and it
    /// fits in `budget` bytes.
    pub fn next_code_request(&mut self, budget: usize) -> Option<(Request, u16)> {
        loop {
            if self.top().waiting_for_acknowledgement {
                return None;
            }

            // Drop cancelled codes before they ever reach the firmware.
            let head_cancelled = self
                .top()
                .pending_codes
                .front()
                .map(|front| front.completer.is_cancelled());
            match head_cancelled {
                None => return None,
                Some(true) => {
                    if let Some(cancelled) = self.top_mut().pending_codes.pop_front() {
                        self.outstanding.remove(&cancelled.ticket);
                        self.check_flushes();
                    }
                    continue;
                }
                Some(false) => {}
            }

            let fits = {
                let front = self.top().pending_codes.front()?;
                packet_wire_len(&Request::Code(front.code.clone())) <= budget
            };
            if !fits {
                return None;
            }

            let pending = self.top_mut().pending_codes.pop_front()?;
            let id = self.allocate_id();
            let mut code = pending.code;
            code.id = id;
            let request = Request::Code(code.clone());
            self.top_mut().in_flight.push_back(InFlight {
                id,
                ticket: pending.ticket,
                code,
                reply: String::new(),
                completer: pending.completer,
            });
            return Some((request, id));
        }
    }

    /// The transfer carrying the packets emitted this cycle succeeded.
    pub fn commit_sent(&mut self) {
        if self.pending_pop {
            self.pending_pop = false;
            self.pop_macro_frame();
        }
        if self.ack_sent {
            self.ack_sent = false;
            self.ack_requested = false;
            self.top_mut().waiting_for_acknowledgement = false;
        }
        // Unlocks resolve on delivery; locks wait for ResourceLocked.
        loop {
            let deliverable = matches!(
                self.top().lock_requests.front(),
                Some(front) if front.unlock && front.sent
            );
            if !deliverable {
                break;
            }
            if let Some(done) = self.top_mut().lock_requests.pop_front() {
                done.completer.complete(());
            }
        }
        self.check_flushes();
    }

    pub fn has_work(&self) -> bool {
        self.macro_completion_due()
            || (self.ack_requested && !self.ack_sent)
            || self.top().lock_requests.front().is_some_and(|l| !l.sent)
            || (!self.top().waiting_for_acknowledgement
                && !self.top().pending_codes.is_empty())
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            channel: self.channel,
            stack_depth: self.stack.len(),
            pending: self.stack.iter().map(|f| f.pending_codes.len()).sum(),
            suspended: self.stack.iter().map(|f| f.suspended_codes.len()).sum(),
            in_flight: self.stack.iter().map(|f| f.in_flight.len()).sum(),
            flush_waiters: self.stack.iter().map(|f| f.flush_requests.len()).sum(),
            lock_waiters: self.stack.iter().map(|f| f.lock_requests.len()).sum(),
            total_pushed: self.total_pushed,
            total_completed: self.total_completed,
            protocol_errors: self.protocol_errors,
        }
    }

    // ---- internals ----------------------------------------------------

    fn top(&self) -> &State {
        self.stack.last().unwrap_or_else(|| unreachable_frame())
    }

    fn top_mut(&mut self) -> &mut State {
        self.stack.last_mut().unwrap_or_else(|| unreachable_frame())
    }

    fn macro_completion_due(&self) -> bool {
        let frame = self.top();
        frame.is_macro()
            && frame.macro_finished()
            && !frame.macro_completed
            && frame.pending_codes.is_empty()
            && frame.suspended_codes.is_empty()
            && frame.in_flight.is_empty()
    }

    fn allocate_id(&mut self) -> u16 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                continue;
            }
            let id = self.next_id;
            let in_use = self
                .stack
                .iter()
                .any(|frame| frame.in_flight.iter().any(|c| c.id == id))
                || self.discarded_ids.contains(&id);
            if !in_use {
                return id;
            }
        }
    }

    fn protocol_violation(&mut self, reason: String) -> LinkError {
        self.protocol_errors += 1;
        tracing::error!(channel = %self.channel, %reason, "protocol violation, aborting channel");
        self.invalidate();
        LinkError::Protocol {
            channel: self.channel,
            reason,
        }
    }

    fn pop_macro_frame(&mut self) {
        if self.stack.len() <= 1 {
            return;
        }
        if let Some(mut frame) = self.stack.pop() {
            let parent = self.top_mut();
            // Unresolved flush barriers keep waiting on the parent frame,
            // and codes pushed in the completion window move down with them.
            while let Some(flush) = frame.flush_requests.pop_front() {
                parent.flush_requests.push_back(flush);
            }
            while let Some(pending) = frame.pending_codes.pop_front() {
                parent.pending_codes.push_back(pending);
            }
            for lock in frame.lock_requests.drain(..) {
                lock.completer.abort();
            }
            parent.resume();
            debug!(channel = %self.channel, depth = self.stack.len(), "macro frame popped");
        }
    }

    /// Abort one frame's waiters, releasing its tickets. In-flight codes
    /// are discarded (late replies get swallowed) when `discard_in_flight`.
    fn abort_frame(&mut self, mut frame: State, discard_in_flight: bool) {
        for pending in frame.pending_codes.drain(..) {
            self.outstanding.remove(&pending.ticket);
            pending.completer.abort();
        }
        for suspended in frame.suspended_codes.drain(..) {
            self.outstanding.remove(&suspended.ticket);
            suspended.completer.abort();
        }
        for in_flight in frame.in_flight.drain(..) {
            self.outstanding.remove(&in_flight.ticket);
            if discard_in_flight {
                self.discarded_ids.insert(in_flight.id);
            }
            in_flight.completer.abort();
        }
        for lock in frame.lock_requests.drain(..) {
            lock.completer.abort();
        }
        // A flush resolves false, not aborted, when its channel dies.
        for flush in frame.flush_requests.drain(..) {
            flush.completer.complete(false);
        }
    }

    fn check_flushes(&mut self) {
        let min_outstanding = self.outstanding.iter().next().copied().unwrap_or(u64::MAX);
        let all_idle = self.stack.iter().all(|f| {
            f.pending_codes.is_empty() && f.suspended_codes.is_empty() && f.in_flight.is_empty()
        });

        loop {
            let resolvable = match self.top().flush_requests.front() {
                Some(front) => {
                    min_outstanding >= front.barrier && (!front.sync_file_streams || all_idle)
                }
                None => false,
            };
            if !resolvable {
                break;
            }
            if let Some(done) = self.top_mut().flush_requests.pop_front() {
                done.completer.complete(true);
            }
        }
    }
}

/// Full teardown used by `invalidate`: everything aborts, nothing is
/// discarded (ids restart anyway).
fn abort_frame_contents(mut frame: State) {
    for pending in frame.pending_codes.drain(..) {
        pending.completer.abort();
    }
    for suspended in frame.suspended_codes.drain(..) {
        suspended.completer.abort();
    }
    for in_flight in frame.in_flight.drain(..) {
        in_flight.completer.abort();
    }
    for lock in frame.lock_requests.drain(..) {
        lock.completer.abort();
    }
    for flush in frame.flush_requests.drain(..) {
        flush.completer.complete(false);
    }
}

fn unreachable_frame() -> ! {
    // The stack always holds at least the base frame.
    panic!("channel stack empty")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sbclink_packet::parse;

    use super::*;
    use crate::state::CodeResult;
    use crate::waiter::Outcome;

    const BUDGET: usize = 2048;
    const SHORT: Duration = Duration::from_millis(10);

    fn channel() -> Channel {
        Channel::new(CodeChannel::Http)
    }

    fn push_line(ch: &mut Channel, line: &str) -> Waiter<CodeResult> {
        ch.push(parse(line, CodeChannel::Http).unwrap())
    }

    fn hand_down(ch: &mut Channel) -> u16 {
        let (request, id) = ch.next_code_request(BUDGET).expect("a code should be due");
        assert!(matches!(request, Request::Code(_)));
        id
    }

    fn ok_flags() -> ReplyFlags {
        ReplyFlags::for_channel(CodeChannel::Http)
    }

    #[test]
    fn fifo_replies_resolve_in_push_order() {
        let mut ch = channel();
        let w1 = push_line(&mut ch, "G0 X10");
        let w2 = push_line(&mut ch, "G0 X20");

        let id1 = hand_down(&mut ch);
        let id2 = hand_down(&mut ch);
        assert_ne!(id1, id2);

        ch.on_reply(id1, ok_flags(), "first").unwrap();
        ch.on_reply(id2, ok_flags(), "second").unwrap();

        assert_eq!(
            w1.wait(),
            Outcome::Completed(CodeResult {
                reply: "first".into(),
                success: true
            })
        );
        assert_eq!(
            w2.wait(),
            Outcome::Completed(CodeResult {
                reply: "second".into(),
                success: true
            })
        );
    }

    #[test]
    fn out_of_order_reply_aborts_channel() {
        let mut ch = channel();
        let w1 = push_line(&mut ch, "G0 X10");
        let w2 = push_line(&mut ch, "G0 X20");

        let _id1 = hand_down(&mut ch);
        let id2 = hand_down(&mut ch);

        let err = ch.on_reply(id2, ok_flags(), "out of order").unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }));

        assert_eq!(w1.wait(), Outcome::Aborted);
        assert_eq!(w2.wait(), Outcome::Aborted);
        assert_eq!(ch.stats().protocol_errors, 1);
        // The channel keeps running on a fresh base frame.
        assert_eq!(ch.stats().stack_depth, 1);
    }

    #[test]
    fn partial_replies_accumulate_until_final() {
        let mut ch = channel();
        let waiter = push_line(&mut ch, "M122");
        let id = hand_down(&mut ch);

        ch.on_reply(id, ok_flags().with(ReplyFlags::PUSH), "part one, ")
            .unwrap();
        ch.on_reply(id, ok_flags(), "part two").unwrap();

        assert_eq!(
            waiter.wait(),
            Outcome::Completed(CodeResult {
                reply: "part one, part two".into(),
                success: true
            })
        );
    }

    #[test]
    fn error_flag_marks_result_failed() {
        let mut ch = channel();
        let waiter = push_line(&mut ch, "G999");
        let id = hand_down(&mut ch);

        ch.on_reply(id, ok_flags().with(ReplyFlags::ERROR), "unknown code")
            .unwrap();

        match waiter.wait() {
            Outcome::Completed(result) => {
                assert!(!result.success);
                assert_eq!(result.reply, "unknown code");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn reply_without_code_is_a_message() {
        let mut ch = channel();
        assert_eq!(
            ch.on_reply(7, ok_flags(), "hello").unwrap(),
            ReplyDisposition::NoCodeInFlight
        );
    }

    #[test]
    fn ids_are_not_reused_while_in_flight() {
        let mut ch = channel();
        let mut ids = Vec::new();
        let mut waiters = Vec::new();
        for _ in 0..5 {
            waiters.push(push_line(&mut ch, "G4 P1"));
            ids.push(hand_down(&mut ch));
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        for waiter in &waiters {
            waiter.cancel();
        }
    }

    #[test]
    fn cancelled_pending_code_is_never_handed_down() {
        let mut ch = channel();
        let w1 = push_line(&mut ch, "G0 X1");
        let w2 = push_line(&mut ch, "G0 X2");
        w1.cancel();

        let id = hand_down(&mut ch);
        ch.on_reply(id, ok_flags(), "ok").unwrap();

        assert_eq!(w1.wait(), Outcome::Cancelled);
        assert!(matches!(w2.wait(), Outcome::Completed(_)));
        // Only one code ever went down.
        assert_eq!(ch.stats().total_completed, 1);
    }

    #[test]
    fn cancelled_in_flight_code_detaches() {
        let mut ch = channel();
        let waiter = push_line(&mut ch, "G28");
        let id = hand_down(&mut ch);

        waiter.cancel();
        // The firmware still answers; the completion is silently dropped.
        ch.on_reply(id, ok_flags(), "done").unwrap();
        assert_eq!(ch.stats().in_flight, 0);
    }

    #[test]
    fn budget_defers_codes() {
        let mut ch = channel();
        let _w = push_line(&mut ch, "G1 X100 Y100 Z10 E5 F3000");
        assert!(ch.next_code_request(8).is_none());
        assert!(ch.has_work());
        assert!(ch.next_code_request(BUDGET).is_some());
    }

    #[test]
    fn flush_resolves_after_prior_codes_only() {
        let mut ch = channel();
        let _w1 = push_line(&mut ch, "G0 X1");
        let flush_a = ch.flush(false);
        let flush_b = ch.flush(false);
        let _w2 = push_line(&mut ch, "G0 X2");

        let id1 = hand_down(&mut ch);
        ch.commit_sent();
        assert_eq!(
            flush_a.wait_timeout(SHORT),
            None,
            "flush must wait for the first code"
        );

        ch.on_reply(id1, ok_flags(), "ok").unwrap();
        // Code 2 is still pending but was queued after the flush.
        assert_eq!(flush_b.wait(), Outcome::Completed(true));
    }

    #[test]
    fn sync_flush_waits_for_full_drain() {
        let mut ch = channel();
        let _w1 = push_line(&mut ch, "G0 X1");
        let id1 = hand_down(&mut ch);
        let _w2 = push_line(&mut ch, "G0 X2");

        let flush_a = ch.flush(true);
        let flush_b = ch.flush(true);
        ch.on_reply(id1, ok_flags(), "ok").unwrap();
        // Code 2 was queued after the flush, but sync waits for everything.
        assert_eq!(flush_a.wait_timeout(SHORT), None);

        let id2 = hand_down(&mut ch);
        ch.on_reply(id2, ok_flags(), "ok").unwrap();
        assert_eq!(flush_b.wait(), Outcome::Completed(true));
    }

    #[test]
    fn flush_survives_macro_nesting() {
        let mut ch = channel();
        // Three base codes; the firmware starts a macro after the second.
        let _w1 = push_line(&mut ch, "G0 X1");
        let _w2 = push_line(&mut ch, "G0 X2");
        let _w3 = push_line(&mut ch, "G0 X3");

        let id1 = hand_down(&mut ch);
        let id2 = hand_down(&mut ch);
        ch.on_reply(id1, ok_flags(), "ok").unwrap();

        ch.on_execute_macro("foo.g", true);
        assert_eq!(ch.stats().stack_depth, 2);
        // Code 3 was parked on the base frame.
        assert_eq!(ch.stats().suspended, 1);
        assert!(ch.start_code_outstanding());

        // Flush registered while the macro frame is on top.
        let flush_a = ch.flush(false);
        let flush_b = ch.flush(false);

        // The macro pushes one code of its own, runs it, then finishes.
        let wm = ch.push(parse("G91", CodeChannel::Http).unwrap());
        let idm = hand_down(&mut ch);
        ch.on_reply(idm, ok_flags(), "ok").unwrap();
        assert!(matches!(wm.wait(), Outcome::Completed(_)));
        ch.macro_finished(true);

        // Completion goes out, the transfer carries it, the frame pops.
        let (request, _) = ch.next_priority_request(BUDGET).expect("completion due");
        assert!(matches!(request, Request::MacroCompleted { .. }));
        ch.commit_sent();
        assert_eq!(ch.stats().stack_depth, 1);

        // Still waiting: code 2 and code 3 are unresolved.
        assert_eq!(flush_a.wait_timeout(SHORT), None);

        ch.on_reply(id2, ok_flags(), "ok").unwrap();
        let id3 = hand_down(&mut ch);
        ch.on_reply(id3, ok_flags(), "ok").unwrap();
        // Only now, with the macro popped and code 3 replied, may it fire.
        assert_eq!(flush_b.wait(), Outcome::Completed(true));
    }

    #[test]
    fn macro_completion_emitted_at_most_once() {
        let mut ch = channel();
        let _w = push_line(&mut ch, "M98 P\"a.g\"");
        let _id = hand_down(&mut ch);
        ch.on_execute_macro("a.g", true);
        ch.macro_finished(true);

        assert!(ch.next_priority_request(BUDGET).is_some());
        // Not committed yet; the completion must not be emitted again.
        assert!(ch.next_priority_request(BUDGET).is_none());
    }

    #[test]
    fn failed_macro_reports_error_in_completion() {
        let mut ch = channel();
        ch.on_execute_macro("missing.g", false);
        ch.macro_finished(false);

        let (request, _) = ch.next_priority_request(BUDGET).expect("completion due");
        assert!(matches!(
            request,
            Request::MacroCompleted { error: true, .. }
        ));
    }

    #[test]
    fn abort_pops_macro_frames_without_completion() {
        let mut ch = channel();
        let w_start = push_line(&mut ch, "M98 P\"a.g\"");
        let id_start = hand_down(&mut ch);
        ch.on_execute_macro("a.g", true);
        let w_macro = ch.push(parse("G1 X5", CodeChannel::Http).unwrap());
        let id_macro = hand_down(&mut ch);

        ch.on_abort(false);

        assert_eq!(ch.stats().stack_depth, 1);
        assert_eq!(w_macro.wait(), Outcome::Aborted);
        // No MacroCompleted may follow the abort.
        assert!(ch.next_priority_request(BUDGET).is_none());

        // A late reply for the killed macro code is swallowed, and the
        // start code still completes normally afterwards.
        assert_eq!(
            ch.on_reply(id_macro, ok_flags(), "late").unwrap(),
            ReplyDisposition::Discarded
        );
        ch.on_reply(id_start, ok_flags().with(ReplyFlags::ERROR), "aborted")
            .unwrap();
        match w_start.wait() {
            Outcome::Completed(result) => assert!(!result.success),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn abort_all_clears_base_queues_too() {
        let mut ch = channel();
        let w1 = push_line(&mut ch, "G0 X1");
        let _id1 = hand_down(&mut ch);
        let w2 = push_line(&mut ch, "G0 X2");
        let flush = ch.flush(false);

        ch.on_abort(true);

        // Pending code aborted, flush resolved false, in-flight kept.
        assert_eq!(w2.wait(), Outcome::Aborted);
        assert_eq!(flush.wait(), Outcome::Completed(false));
        assert_eq!(ch.stats().in_flight, 1);
        w1.cancel();
    }

    #[test]
    fn invalidate_aborts_everything_and_keeps_channel_usable() {
        let mut ch = channel();
        let w1 = push_line(&mut ch, "G0 X1");
        let _id = hand_down(&mut ch);
        let w2 = push_line(&mut ch, "G0 X2");
        let flush = ch.flush(false);
        let lock = ch.lock();

        ch.invalidate();

        assert_eq!(w1.wait(), Outcome::Aborted);
        assert_eq!(w2.wait(), Outcome::Aborted);
        assert_eq!(flush.wait(), Outcome::Completed(false));
        assert_eq!(lock.wait(), Outcome::Aborted);

        let w3 = push_line(&mut ch, "G28");
        let id3 = hand_down(&mut ch);
        ch.on_reply(id3, ok_flags(), "ok").unwrap();
        assert!(matches!(w3.wait(), Outcome::Completed(_)));
    }

    #[test]
    fn lock_waits_for_resource_locked() {
        let mut ch = channel();
        let first = ch.lock();
        let second = ch.lock();

        let (request, _) = ch.next_priority_request(BUDGET).expect("lock request due");
        assert!(matches!(
            request,
            Request::LockMovementAndWaitForStandstill { .. }
        ));
        // Only the head request goes out.
        assert!(ch.next_priority_request(BUDGET).is_none());

        ch.on_resource_locked();
        assert_eq!(first.wait(), Outcome::Completed(()));
        // The second lock now becomes the head and may be sent.
        assert_eq!(second.wait_timeout(SHORT), None);
        assert!(ch.next_priority_request(BUDGET).is_some());
    }

    #[test]
    fn unlock_resolves_on_delivery() {
        let mut ch = channel();
        let unlock = ch.unlock();

        let (request, _) = ch.next_priority_request(BUDGET).expect("unlock due");
        assert!(matches!(request, Request::Unlock { .. }));
        ch.commit_sent();
        assert_eq!(unlock.wait(), Outcome::Completed(()));
    }

    #[test]
    fn acknowledgement_unblocks_codes() {
        let mut ch = channel();
        ch.await_acknowledgement();
        let _w = push_line(&mut ch, "G0 X1");
        assert!(ch.next_code_request(BUDGET).is_none());

        ch.acknowledge();
        let (request, _) = ch.next_priority_request(BUDGET).expect("ack due");
        assert!(matches!(request, Request::Ack { .. }));
        ch.commit_sent();

        assert!(ch.next_code_request(BUDGET).is_some());
    }
}
