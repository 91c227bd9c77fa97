use std::io::BufRead;

use ph_core::config::Config;
use ph_session::{SessionEvent, SessionManager};
use tracing::{info, warn};

use super::stdout_buffers;

/// Run the `shell` subcommand: one interactive shell fed line by line from
/// our stdin. Ends on stdin EOF, Ctrl-C, or when the shell exits.
pub async fn run(config: Config, key: String, initial: String) -> anyhow::Result<()> {
    let manager = SessionManager::with_buffer_factory(config, stdout_buffers());
    let events = manager.subscribe();
    let handle = manager.resolve(&key, &initial, None)?;
    info!(key = %key, pid = handle.pid(), "shell started");

    let (line_tx, line_rx) = flume::unbounded::<String>();
    std::thread::Builder::new()
        .name("ph-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    loop {
        tokio::select! {
            line = line_rx.recv_async() => match line {
                Ok(line) => manager.execute(&key, &line),
                Err(_) => break,
            },
            event = events.recv_async() => match event? {
                SessionEvent::Exited { key: k, exit_code, .. } if k == key => {
                    info!(key = %key, ?exit_code, "shell exited");
                    break;
                }
                SessionEvent::Evicted { key: k, .. } if k == key => {
                    warn!(key = %key, "shell evicted");
                    break;
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let report = tokio::task::spawn_blocking(move || manager.stop(&key, true)).await?;
    if let Some(report) = report {
        info!(
            pid = report.pid,
            graceful = report.graceful,
            escalated = report.escalated,
            "shell stopped"
        );
    }
    Ok(())
}
