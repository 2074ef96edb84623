//! Single-completion cells.
//!
//! A [`Waiter`] is handed to a producer task (IPC handler, macro runner)
//! while the matching [`Completer`] stays with the channel and is resolved
//! only from the Processor task. Cancelling a waiter detaches it: a later
//! completion is a no-op, the producer has already moved on.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How a waiter finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    /// The channel was invalidated or hit a protocol violation.
    Aborted,
    /// The caller cancelled before completion.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

enum CellState<T> {
    Empty,
    Done(Outcome<T>),
    Taken,
}

struct Cell<T> {
    state: Mutex<CellState<T>>,
    cond: Condvar,
}

impl<T> Cell<T> {
    fn resolve(&self, outcome: Outcome<T>) {
        if let Ok(mut state) = self.state.lock() {
            if matches!(*state, CellState::Empty) {
                *state = CellState::Done(outcome);
                self.cond.notify_all();
            }
        }
    }
}

/// The consumer half; blocks until the channel resolves it.
pub struct Waiter<T> {
    cell: Arc<Cell<T>>,
}

/// The producer half, held by the channel and resolved by the Processor.
pub struct Completer<T> {
    cell: Arc<Cell<T>>,
}

/// Create a connected waiter/completer pair.
pub fn pair<T>() -> (Waiter<T>, Completer<T>) {
    let cell = Arc::new(Cell {
        state: Mutex::new(CellState::Empty),
        cond: Condvar::new(),
    });
    (
        Waiter {
            cell: Arc::clone(&cell),
        },
        Completer { cell },
    )
}

impl<T> Waiter<T> {
    /// Block until resolved.
    pub fn wait(self) -> Outcome<T> {
        let mut state = match self.cell.state.lock() {
            Ok(state) => state,
            Err(_) => return Outcome::Aborted,
        };
        loop {
            match std::mem::replace(&mut *state, CellState::Taken) {
                CellState::Done(outcome) => return outcome,
                CellState::Taken => return Outcome::Aborted,
                CellState::Empty => {
                    *state = CellState::Empty;
                    state = match self.cell.cond.wait(state) {
                        Ok(state) => state,
                        Err(_) => return Outcome::Aborted,
                    };
                }
            }
        }
    }

    /// Block until resolved or the timeout elapses.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.cell.state.lock().ok()?;
        loop {
            match std::mem::replace(&mut *state, CellState::Taken) {
                CellState::Done(outcome) => return Some(outcome),
                CellState::Taken => return Some(Outcome::Aborted),
                CellState::Empty => {
                    *state = CellState::Empty;
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (guard, result) = self.cell.cond.wait_timeout(state, remaining).ok()?;
                    state = guard;
                    if result.timed_out() && matches!(*state, CellState::Empty) {
                        return None;
                    }
                }
            }
        }
    }

    /// Detach: the underlying work keeps running, the result is discarded.
    pub fn cancel(&self) {
        self.cell.resolve(Outcome::Cancelled);
    }
}

impl<T> Completer<T> {
    pub fn complete(self, value: T) {
        self.cell.resolve(Outcome::Completed(value));
    }

    pub fn abort(self) {
        self.cell.resolve(Outcome::Aborted);
    }

    /// True when the waiter side cancelled first.
    pub fn is_cancelled(&self) -> bool {
        match self.cell.state.lock() {
            Ok(state) => matches!(*state, CellState::Done(Outcome::Cancelled)),
            Err(_) => false,
        }
    }
}
