//! PTY-backed terminal sessions keyed by caller-chosen names.
//!
//! The crate spawns shells or arbitrary console programs inside
//! pseudo-terminals, coalesces their output before it reaches a terminal
//! buffer, and tears them down reliably, including every descendant process.
//!
//! Key components:
//! - [`SessionManager`]: key-to-session registry with LRU eviction, rekeying
//!   and liveness queries
//! - [`OutputBatcher`]: latency-aware output coalescing
//! - [`Session`]: one PTY child with its reader/writer threads and teardown
//! - [`ProcessTable`]: process snapshots and tree kills
//! - [`ScrollbackState`]: history boost, pin and delayed shrink

pub mod batcher;
pub mod bootstrap;
pub mod buffer;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod manager;
pub mod process_tree;
pub mod scrollback;
pub mod session;

pub use batcher::{BatcherStats, OutputBatcher};
pub use buffer::{BufferFactory, HistoryBuffer, HistoryBufferFactory, TerminalBuffer};
pub use dispatch::{SerialQueue, TimerHandle};
pub use error::{Result, SessionError};
pub use events::{EventBus, SessionEvent};
pub use manager::{ConsoleSpec, SessionHandle, SessionManager, SessionSummary};
pub use process_tree::ProcessTable;
pub use scrollback::{ScrollbackSnapshot, ScrollbackState};
pub use session::{LaunchSpec, Session, TeardownReport};
