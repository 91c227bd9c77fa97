use std::path::PathBuf;

use ph_core::config::Config;
use ph_session::{ConsoleSpec, SessionManager};
use tracing::{debug, info};

use super::{stdout_buffers, wait_for_exit};

/// Run the `run` subcommand. Returns the program's exit code when it exited
/// on its own.
pub async fn run(
    config: Config,
    key: String,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    command: Vec<String>,
) -> anyhow::Result<Option<u32>> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("no program given");
    };
    let mut spec = ConsoleSpec::new(program.clone()).args(args.iter().cloned());
    if let Some(cwd) = cwd {
        spec = spec.cwd(cwd);
    }
    for (k, v) in env {
        spec = spec.env(k, v);
    }

    let manager = SessionManager::with_buffer_factory(config, stdout_buffers());
    let events = manager.subscribe();
    let handle = manager.resolve(&key, "", Some(spec))?;
    info!(key = %key, pid = handle.pid(), program = %program, "console session started");

    let exit_code = wait_for_exit(&events, &key).await?;
    let report = tokio::task::spawn_blocking(move || manager.stop(&key, true)).await?;
    if let Some(report) = &report {
        debug!(report = %serde_json::to_string(report)?, "console session stopped");
    }
    Ok(exit_code.or(report.and_then(|r| r.exit_code)))
}

/// Parse a `KEY=VALUE` argument.
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_first_equals() {
        assert_eq!(
            parse_env_pair("OPTS=a=b").unwrap(),
            ("OPTS".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_env_pair("EMPTY=").unwrap().1, "");
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }
}
