mod command;
mod console;
mod frontend;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tether_core::{ChatId, Orchestrator, PatternResolver, ProcessLauncher, TetherConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

use console::ConsoleTransport;
use frontend::{Flow, Frontend};

#[derive(Parser)]
#[command(version, about = "Drive coding assistant sessions from a chat")]
struct Args {
    /// Config file (default: ~/.tether/config.json)
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Default model for new sessions
    #[arg(long, env = "TETHER_MODEL")]
    model: Option<String>,

    /// Working directory pattern offered to the chat (repeatable, e.g. ~/src/*)
    #[arg(long = "dir", env = "TETHER_DIRS", value_delimiter = ',')]
    dirs: Vec<String>,

    /// Chat identifier for this console
    #[arg(long, default_value = "console")]
    chat: String,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    save_config: bool,

    /// Assistant command and its arguments, speaking JSON lines on stdio
    #[arg(last = true, value_name = "COMMAND")]
    assistant: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up file-based tracing (logs go to ~/.tether/tether.log)
    {
        let log_dir = TetherConfig::data_dir();
        std::fs::create_dir_all(&log_dir).ok();
        let log_file = std::fs::File::create(log_dir.join("tether.log"))?;

        use tracing_subscriber::EnvFilter;
        let filter =
            EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(TetherConfig::config_path);
    let mut config = match &args.config {
        Some(path) => TetherConfig::load_from(path),
        None => TetherConfig::load(),
    }
    .with_context(|| format!("failed to read {}", config_path.display()))?;

    // CLI env/flags override stored config
    if let Some(model) = args.model {
        config.default_model = model;
    }
    if !args.dirs.is_empty() {
        config.directories = args.dirs;
    }
    if !args.assistant.is_empty() {
        config.assistant_command = args.assistant;
    }
    if args.save_config {
        config.save_to(&config_path)?;
        eprintln!("Saved configuration to {}", config_path.display());
    }
    if config.assistant_command.is_empty() {
        anyhow::bail!(
            "no assistant command configured; pass it after `--` or set assistant_command in {}",
            config_path.display()
        );
    }
    tracing::info!(
        "starting with model {} and {} directory pattern(s)",
        config.default_model,
        config.directories.len()
    );

    let transport = Arc::new(ConsoleTransport::stdout());
    let orchestrator = Orchestrator::new(
        config.orchestrator_config(),
        transport.clone(),
        Arc::new(ProcessLauncher::new(config.assistant_command.clone())),
        Arc::new(PatternResolver::new(config.directories.clone())),
    );
    let frontend = Frontend::new(orchestrator.clone(), transport, ChatId::new(args.chat));
    frontend.greet().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if frontend.handle_line(&line).await == Flow::Exit {
                    break;
                }
            }
        }
    }

    eprintln!("Shutting down...");
    orchestrator.shutdown().await;
    Ok(())
}
