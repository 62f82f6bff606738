//! gitgridd — the GitGrid daemon binary.
//!
//! # Usage
//!
//! ```text
//! gitgridd run --config /etc/gitgrid/gitgrid.toml --port 8443
//! gitgridd check-config --config /etc/gitgrid/gitgrid.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gitgrid_core::GitgridConfig;

const DEFAULT_FILTER: &str = "info,gitgridd=debug,gitgrid=debug";

#[derive(Parser)]
#[command(name = "gitgridd", about = "GitGrid storage control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to gitgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// API listen port (overrides `api.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory (overrides `storage.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Local node identity (overrides `node.id`).
        #[arg(long)]
        node_id: Option<String>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a config file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<GitgridConfig> {
    match path {
        Some(path) => Ok(GitgridConfig::from_file(path)?),
        None => Ok(GitgridConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            node_id,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_ref())?;
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            if let Some(node_id) = node_id {
                config.node.id = node_id;
            }
            gitgridd::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            for warning in config.validate()? {
                eprintln!("warning: {warning}");
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
