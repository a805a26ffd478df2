//! CLI entry and dispatch.

use std::path::PathBuf;

use adbrief_core::config::{self, Config};
use anyhow::{Context, Result};
use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "adbrief")]
#[command(version)]
#[command(about = "Interruptible agent sessions that draft campaign documents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file to use instead of $ADBRIEF_HOME/config.toml
    #[arg(long, global = true, value_name = "PATH", env = "ADBRIEF_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start an interactive session (default)
    Chat,

    /// Run the auth proxy in the foreground until Ctrl+C
    Proxy {
        /// Upstream base URL (defaults to the configured upstream)
        #[arg(long, value_name = "URL")]
        target: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect and lock document sections
    Docs {
        #[command(subcommand)]
        command: DocsCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

#[derive(clap::Subcommand)]
enum DocsCommands {
    /// Print all sections, or one
    Show {
        #[arg(value_name = "SECTION")]
        section: Option<String>,
    },
    /// Protect a section from automated merges
    Lock {
        #[arg(value_name = "SECTION")]
        section: String,
    },
    /// Allow automated merges into a section again
    Unlock {
        #[arg(value_name = "SECTION")]
        section: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(config::paths::config_path);

    let Some(command) = cli.command else {
        let config = load(&config_path)?;
        return commands::chat::run(&config).await;
    };

    match command {
        Commands::Chat => {
            let config = load(&config_path)?;
            commands::chat::run(&config).await
        }
        Commands::Proxy { target } => {
            let config = load(&config_path)?;
            commands::proxy::run(&config, target.as_deref()).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path(&config_path);
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(&config_path),
        },
        Commands::Docs { command } => {
            let config = load(&config_path)?;
            match command {
                DocsCommands::Show { section } => commands::docs::show(&config, section.as_deref()),
                DocsCommands::Lock { section } => commands::docs::set_locked(&config, &section, true),
                DocsCommands::Unlock { section } => {
                    commands::docs::set_locked(&config, &section, false)
                }
            }
        }
    }
}

fn load(path: &std::path::Path) -> Result<Config> {
    Config::load_from(path).context("load config")
}
