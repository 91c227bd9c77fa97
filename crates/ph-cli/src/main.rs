mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ph_core::config::Config;

/// ptyhive CLI -- run shells and console programs in managed PTY sessions.
#[derive(Parser)]
#[command(name = "ph", version, about)]
struct Cli {
    /// Config file to use instead of ~/.ptyhive/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit structured JSON logs on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive shell session; stdin lines are executed in it.
    Shell {
        /// Session key.
        #[arg(long, default_value = "shell")]
        key: String,
        /// Command typed into the shell once it has started.
        #[arg(long, default_value = "")]
        initial: String,
    },

    /// Run a program directly in a PTY and stream its output until it exits.
    Run {
        #[arg(long, default_value = "console")]
        key: String,
        /// Working directory for the program.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra environment variable, as KEY=VALUE. Repeatable.
        #[arg(long = "env", value_parser = commands::run::parse_env_pair)]
        env: Vec<(String, String)>,
        /// Program followed by its arguments.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Show the descendant tree of a process.
    Tree {
        pid: u32,
        /// Kill the whole tree instead of just printing it.
        #[arg(long)]
        kill: bool,
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if cli.json_logs {
        ph_telemetry::init_logging_json("ph", &config.general.log_level);
    } else {
        ph_telemetry::init_from_config("ph", &config.general);
    }

    match cli.command {
        Commands::Shell { key, initial } => {
            commands::shell::run(config, key, initial).await?;
        }
        Commands::Run {
            key,
            cwd,
            env,
            command,
        } => {
            let code = commands::run::run(config, key, cwd, env, command).await?;
            if let Some(code) = code.filter(|c| *c != 0) {
                std::process::exit(i32::try_from(code).unwrap_or(1));
            }
        }
        Commands::Tree { pid, kill, json } => {
            commands::tree::run(&config, pid, kill, json)?;
        }
        Commands::Config => {
            commands::config::run(&config)?;
        }
    }

    Ok(())
}
