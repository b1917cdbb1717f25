//! Terrarium CLI
//!
//! Thin dispatch over the environment orchestrator: `up` converges,
//! `status` reports live health, `reset` destroys and reinitializes the
//! secret store (confirmation required).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use terrarium::config::EnvironmentConfig;
use terrarium::control_plane::ShellControlPlane;
use terrarium::environment::Environment;
use terrarium::Result;

#[derive(Parser)]
#[command(name = "terrarium", about = "Idempotent local environment bring-up", version)]
struct Cli {
    /// Path to the environment config file (defaults are built in)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Converge the environment (idempotent; safe to rerun)
    Up,
    /// Show live health of every component
    Status,
    /// Destroy and reinitialize the secret store
    Reset {
        /// Confirm the destructive reset
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EnvironmentConfig::load(path)?,
        None => EnvironmentConfig::default(),
    };

    let control_plane = Arc::new(match &config.kubeconfig {
        Some(path) => ShellControlPlane::with_kubeconfig(path.clone()),
        None => ShellControlPlane::new(),
    });
    let environment = Environment::new(config, control_plane);

    match cli.command {
        Command::Up => {
            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });
            environment.converge(&cancel).await?;
            Ok(())
        }
        Command::Status => {
            for (name, state) in environment.status().await? {
                println!("  {:24} {}", name, state);
            }
            Ok(())
        }
        Command::Reset { yes } => {
            if !yes {
                eprintln!(
                    "reset destroys the secret store's backing data; rerun with --yes to confirm"
                );
                std::process::exit(2);
            }
            environment.reset_secret_store().await?;
            println!("secret store reset and ready");
            Ok(())
        }
    }
}
