use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use watchkeeper::config::Config;

#[derive(Parser)]
#[command(
    name = "watchkeeper",
    about = "Lifecycle reconciliation daemon for externally managed infrastructure",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $WATCHKEEPER_CONFIG, then /etc/watchkeeper/watchkeeper.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + watchdogs)
    Serve {
        /// Override the configured listen address
        #[arg(long)]
        bind: Option<String>,
    },

    /// List built-in controller types
    Controllers {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = watchkeeper::logging::bootstrap(|| Config::resolve(cli.config.as_deref()))?;
    watchkeeper::logging::init(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.listen_address = bind;
            }
            tracing::info!(addr = %config.server.listen_address, "starting watchkeeper daemon");

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                }
                signal.cancel();
            });

            watchkeeper::serve(config, shutdown).await?;
        }
        Commands::Controllers { json } => {
            let (resources, monitors) = watchkeeper::builtin_controllers(&config);
            if json {
                let listing = serde_json::json!({
                    "resources": resources.list_types(),
                    "monitors": monitors.list_types(),
                });
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                println!("Resource controllers:");
                for kind in resources.list_types() {
                    println!("  {kind}");
                }
                println!("Monitor controllers:");
                for kind in monitors.list_types() {
                    println!("  {kind}");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_toml()?),
        },
    }

    Ok(())
}
