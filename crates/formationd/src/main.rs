//! formationd — the Formation provisioning daemon.
//!
//! Single binary that assembles the provisioning stack: settings, the
//! plugin registries, and the system-wide state machine.
//!
//! # Usage
//!
//! ```text
//! formationd create system.json --config formation.toml
//! formationd check system.json
//! formationd plugins
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use formation_core::{Settings, System};
use formation_engine::{Collaborators, SystemProvisioner, SystemState};
use formation_provider::{builtin_balancers, builtin_dns, builtin_providers};

#[derive(Parser)]
#[command(name = "formationd", about = "Formation provisioning daemon")]
struct Cli {
    /// Path to the settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a system from a JSON description.
    Create {
        /// Path to the system description.
        system: PathBuf,
    },
    /// Parse and validate a system description without provisioning.
    Check {
        /// Path to the system description.
        system: PathBuf,
    },
    /// List the registered provider plugins.
    Plugins,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,formationd=debug,formation=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };

    match cli.command {
        Command::Create { system } => create(&system, settings).await,
        Command::Check { system } => check(&system, settings),
        Command::Plugins => plugins(),
    }
}

async fn create(path: &PathBuf, settings: Settings) -> anyhow::Result<ExitCode> {
    let system = load_system(path)?;
    let collab = collaborators(&settings)?;
    info!(
        nodes = system.len(),
        provider = settings.provider,
        "starting provisioning run"
    );

    let mut provisioner = SystemProvisioner::new(system, settings, collab);
    let state = provisioner.run().await;
    println!("{}", serde_json::to_string_pretty(&provisioner.describe())?);

    match state {
        SystemState::Complete => Ok(ExitCode::SUCCESS),
        _ => Ok(ExitCode::FAILURE),
    }
}

fn check(path: &PathBuf, settings: Settings) -> anyhow::Result<ExitCode> {
    let mut system = load_system(path)?;
    system.rebalance()?;
    // Resolving the plugins surfaces configuration mistakes early.
    collaborators(&settings)?;
    println!("{}", serde_json::to_string_pretty(&system.describe())?);
    Ok(ExitCode::SUCCESS)
}

fn plugins() -> anyhow::Result<ExitCode> {
    let report = serde_json::json!({
        "providers": builtin_providers().names(),
        "load_balancers": builtin_balancers().names(),
        "dns_providers": builtin_dns().names(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn load_system(path: &PathBuf) -> anyhow::Result<System> {
    let text = std::fs::read_to_string(path)?;
    Ok(System::from_json(&text)?)
}

/// Resolve the configured plugins from the registries. The balancer and
/// DNS plugins are optional; systems declaring balancers without one
/// configured fail at the load-balancing transition.
fn collaborators(settings: &Settings) -> anyhow::Result<Collaborators> {
    let provider = builtin_providers().resolve(&settings.provider)?;
    let balancer = settings
        .load_balancer_provider
        .as_deref()
        .map(|name| builtin_balancers().resolve(name))
        .transpose()?;
    let dns = settings
        .dns_provider
        .as_deref()
        .map(|name| builtin_dns().resolve(name))
        .transpose()?;
    Ok(Collaborators {
        provider,
        balancer,
        dns,
    })
}
