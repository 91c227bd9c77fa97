//! Shared configuration for ptyhive.
//!
//! Every tunable that governs session lifetime, output pacing, scrollback
//! sizing and teardown timing lives here so the session crate never embeds
//! magic numbers.

pub mod config;
