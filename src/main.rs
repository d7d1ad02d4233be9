//! Deployer Server Agent
//!
//! Keeps the SSH authorized_keys files of this server's system accounts in
//! sync with your team's keys on Deployer, and reports server metrics.
//!
//! # Usage
//! ```bash
//! # Bring a system account under management
//! deployer add --username deploy --apikey <account-api-key>
//!
//! # Stop managing an account (its authorized_keys file is left in place)
//! deployer remove --username deploy
//!
//! # Pull the latest keys for every managed account
//! deployer sync
//!
//! # Send current server metrics
//! deployer monitor
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use deployer_agent::agents::keys::{mask_api_key, AgentError, HttpKeySource, KeySyncAgent};
use deployer_agent::agents::MonitorAgent;
use deployer_agent::config::{ConfigStore, DEFAULT_CONFIG_PATH};

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser)]
#[command(name = "deployer")]
#[command(about = "Deployer Server Agent", long_about = "The Deployer Server Agent keeps your team's SSH keys in sync on this server.")]
#[command(version)]
struct Cli {
    /// Path to the agent configuration file
    #[arg(long, env = "DEPLOYER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines (for log shippers)
    #[arg(long, global = true, env = "DEPLOYER_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a system account to Deployer
    Add {
        /// The username of the system account (e.g., root)
        #[arg(short, long)]
        username: String,

        /// The account's API key, shown when adding it in the Deployer control panel
        #[arg(short = 'k', long)]
        apikey: String,
    },

    /// Remove a system account from Deployer
    Remove {
        /// The username of the system account
        #[arg(short, long)]
        username: String,
    },

    /// Sync all SSH keys with Deployer
    Sync {
        /// Output format for the summary
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Collect server metrics and send them to Deployer
    Monitor,

    /// List the system accounts managed by Deployer
    List,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let installed = if cli.json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    if let Err(e) = installed {
        eprintln!("failed to initialise logging: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<AgentError>() {
                Some(AgentError::DuplicateAccount(_)) => info!("{}", e),
                _ => error!("❌ {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = ConfigStore::new(&cli.config);

    match cli.command {
        Commands::Add { username, apikey } => {
            info!(username = %username, "➕ Adding system account");

            let mut agent = KeySyncAgent::open(store)?;
            let outcome = agent.add(&username, &apikey)?;

            if let Some(backup) = outcome.backup {
                info!(
                    "An existing authorized_keys file was found. It has been moved to {}",
                    backup.display()
                );
            }
            println!("✅ {} is now managed by Deployer", username);
        }

        Commands::Remove { username } => {
            let mut agent = KeySyncAgent::open(store)?;
            agent.remove(&username)?;

            println!("✅ {} has been removed from Deployer", username);
        }

        Commands::Sync { output } => {
            // Settings are validated before any account is touched.
            let target = store.load()?.sync_target()?;
            let agent = KeySyncAgent::open(store)?;
            let source = HttpKeySource::new()?;

            let report = agent
                .sync(&source, &target)
                .await
                .context("Sync aborted; no further accounts were processed")?;

            match output {
                OutputFormat::Text => println!("{}", report.display()),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialize sync report")?
                ),
            }
        }

        Commands::Monitor => {
            let target = store.load()?.monitor_target()?;
            let agent = MonitorAgent::new(target)?;
            agent.report().await?;
        }

        Commands::List => {
            let agent = KeySyncAgent::open(store)?;
            let accounts = agent.accounts();

            println!("\n{:<32} {:<12}", "USERNAME", "API KEY");
            println!("{}", "-".repeat(45));
            for account in accounts {
                println!("{:<32} {:<12}", account.username, mask_api_key(&account.api_key));
            }

            info!("✅ Listed {} accounts", accounts.len());
        }
    }

    Ok(())
}
