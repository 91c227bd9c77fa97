pub mod config;
pub mod run;
pub mod shell;
pub mod tree;

use std::io::Write;
use std::sync::Arc;

use ph_session::{BufferFactory, SessionEvent, TerminalBuffer};

/// Terminal buffer that copies session output straight to our stdout.
struct StdoutBuffer;

impl TerminalBuffer for StdoutBuffer {
    fn feed(&self, bytes: &[u8]) {
        let mut out = std::io::stdout().lock();
        if out.write_all(bytes).and_then(|_| out.flush()).is_err() {
            tracing::debug!("stdout closed, dropping session output");
        }
    }

    fn resize_history(&self, _lines: usize) {}
}

pub fn stdout_buffers() -> Arc<dyn BufferFactory> {
    Arc::new(|_key: &str, _lines: usize| -> Arc<dyn TerminalBuffer> { Arc::new(StdoutBuffer) })
}

/// Wait until `key` exits or the user presses Ctrl-C. Returns the exit code
/// when the process exited on its own.
pub async fn wait_for_exit(
    events: &flume::Receiver<SessionEvent>,
    key: &str,
) -> anyhow::Result<Option<u32>> {
    loop {
        tokio::select! {
            event = events.recv_async() => match event? {
                SessionEvent::Exited { key: k, exit_code, .. } if k == key => return Ok(exit_code),
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => return Ok(None),
        }
    }
}
