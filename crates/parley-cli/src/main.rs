//! `parley`: talk to the control plane from a terminal.
//!
//! Logging: `RUST_LOG` overrides `log.level` from the config file. Output
//! goes to stderr with credentials masked.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_common::AgentType;
use parley_config::{AppConfig, ConfigLoader, LogConfig};
use parley_security::RedactingWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parley", version)]
#[command(about = "Parley - per-user conversational control plane", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.parley/config.{yml,yaml,toml}
    #[arg(long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat through the full dispatcher
    Chat {
        #[arg(long, short)]
        user: String,
        /// Agent to talk to; defaults to `dispatcher.default_agent`
        #[arg(long, short)]
        agent: Option<AgentType>,
    },
    /// List a user's sessions
    Sessions {
        #[arg(long, short)]
        user: String,
    },
    /// Run one summarization pass over every session and exit
    Summarize,
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load, validate and print the effective configuration
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.log);

    match cli.command {
        Command::Chat { user, agent } => commands::chat(&config, &user, agent).await,
        Command::Sessions { user } => commands::sessions(&config, &user).await,
        Command::Summarize => commands::summarize(&config).await,
        Command::Config {
            action: ConfigAction::Check,
        } => commands::config_check(&config),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => ConfigLoader::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let loader = ConfigLoader::new();
            loader.load().with_context(|| {
                format!("failed to load config from {}", loader.config_dir().display())
            })
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr());
    // a second init (tests, embedding) is harmless
    let _ = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
