#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use famulus::agent::ModeController;
use famulus::config::Config;
use famulus::permissions::{PermissionLedger, PermissionStatus, Scope};
use famulus::store::open_state_pool;
use famulus::{events, gateway};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(
    name = "famulus",
    about = "Autonomous embodied desktop-companion control core",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent (ambient loop, monitors, invocation gateway)
    Run,
    /// Send one prompt to a running agent
    Ask {
        /// The prompt text
        prompt: String,
    },
    /// Query a running agent's health
    Status,
    /// Inspect or edit the permission ledger
    Permissions {
        #[command(subcommand)]
        command: PermissionCommand,
    },
}

#[derive(Subcommand)]
enum PermissionCommand {
    /// List stored grants
    List,
    /// Grant or deny a scope (status: allow | deny | ask)
    Grant {
        scope: String,
        status: String,
        #[arg(long, default_value = "ambient")]
        agent_id: String,
    },
    /// Delete a grant, reverting the scope to ask
    Revoke {
        scope: String,
        #[arg(long, default_value = "ambient")]
        agent_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    let config = Config::load_or_init()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_agent(config).await,
        Command::Ask { prompt } => {
            let response =
                gateway_exchange(&config, &serde_json::json!({ "prompt": prompt }).to_string())
                    .await?;
            println!("{response}");
            Ok(())
        }
        Command::Status => {
            let response = gateway_exchange(&config, "HEALTH").await?;
            println!("{response}");
            Ok(())
        }
        Command::Permissions { command } => run_permissions(config, command).await,
    }
}

async fn run_agent(config: Config) -> Result<()> {
    let gateway_config = config.gateway.clone();
    let controller = ModeController::build(config).await?;
    controller.start().await;

    let (listener, _port) = gateway::bind(&gateway_config).await?;
    let gateway_task = tokio::spawn(gateway::serve(
        Arc::clone(&controller) as Arc<dyn gateway::PromptHandler>,
        listener,
        controller.cancelled_token(),
    ));

    // Log mode switches and executed actions for operators tailing stdout.
    let mut event_rx = controller.events().subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let events::AgentEvent::ActionExecuted {
                action,
                next_interval_secs,
            } = event
            {
                tracing::debug!(action, next_interval_secs, "action complete");
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    controller.shutdown().await;
    gateway_task.abort();
    event_task.abort();
    Ok(())
}

async fn gateway_exchange(config: &Config, request: &str) -> Result<String> {
    let address = (config.gateway.host.as_str(), config.gateway.port);
    let mut stream = TcpStream::connect(address)
        .await
        .context("connect to agent gateway (is `famulus run` active?)")?;
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn run_permissions(config: Config, command: PermissionCommand) -> Result<()> {
    let pool = open_state_pool(&config.state_dir).await?;
    let ledger = PermissionLedger::new(pool).await?;

    match command {
        PermissionCommand::List => {
            let grants = ledger.list(None).await?;
            if grants.is_empty() {
                println!("no grants stored; every scope defaults to ask");
            }
            for grant in grants {
                println!(
                    "{:<12} {:<40} {:<6} {}",
                    grant.agent_id,
                    grant.scope,
                    grant.status.as_str(),
                    grant.updated_at
                );
            }
        }
        PermissionCommand::Grant {
            scope,
            status,
            agent_id,
        } => {
            let scope: Scope = scope.parse()?;
            let status: PermissionStatus = status.parse()?;
            ledger.set(&agent_id, scope, status).await?;
            println!("{agent_id} {scope} -> {}", status.as_str());
        }
        PermissionCommand::Revoke { scope, agent_id } => {
            let scope: Scope = scope.parse()?;
            ledger.revoke(&agent_id, scope).await?;
            println!("{agent_id} {scope} -> ask");
        }
    }
    Ok(())
}
