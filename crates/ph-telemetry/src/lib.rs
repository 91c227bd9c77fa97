//! Logging setup for ptyhive binaries.
//!
//! Log lines always go to stderr: stdout belongs to the terminal output being
//! streamed from PTY sessions.

pub mod logging;

pub use logging::{init_from_config, init_logging, init_logging_json};
