//! Channel state machines and the transfer-driving Processor.
//!
//! The link layer multiplexes twelve logical code channels onto one SPI
//! transfer stream. Each channel keeps a stack of execution frames (nested
//! macros), FIFO code ordering with correlation ids, and queues of flush,
//! lock and code waiters. A single [`Processor`] task owns the transfer;
//! producers interact through a cloneable [`LinkHandle`] whose waiters are
//! resolved only from the Processor task.

pub mod channel;
pub mod channels;
pub mod error;
pub mod processor;
pub mod sink;
pub mod state;
pub mod waiter;

pub use channel::{Channel, ChannelStats, ReplyDisposition};
pub use channels::{ChannelSet, LinkDiagnostics, LinkHandle};
pub use error::{LinkError, Result};
pub use processor::{Processor, ProcessorConfig};
pub use sink::{EventSink, NullSink};
pub use state::{CodeResult, MacroFile, State};
pub use waiter::{Completer, Outcome, Waiter};
