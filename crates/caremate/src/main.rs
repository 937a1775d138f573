#[cfg(feature = "cli")]
use caremate::{
    config::Config,
    model_runtime::{plan_runtime, BackendRouter, RouterTimeouts, RuntimeConfig},
    run_server, MemoryDatabase, SessionManager,
};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "caremate", version, about = "Offline care companion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service and the check-in scheduler (default).
    Serve,
    /// Print one session with its messages and summaries as JSON.
    Export { owner_id: String, session_id: String },
    /// Show which backend and device the configured model resolves to.
    CheckModel {
        /// Also start the engine and run a health check.
        #[arg(long)]
        probe: bool,
    },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    caremate::telemetry::init_tracing("info");

    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(cfg).await,
        Command::Export { owner_id, session_id } => {
            let db = Arc::new(MemoryDatabase::new(&cfg.db_path)?);
            // Export never generates, so the engine plan is left empty.
            let router = Arc::new(BackendRouter::new(
                RuntimeConfig::default(),
                RouterTimeouts::from_config(&cfg),
            ));
            let sessions = SessionManager::new(db, router, &cfg)?;
            let export = sessions.export_session(&owner_id, &session_id)?;
            println!("{}", serde_json::to_string_pretty(&export)?);
            Ok(())
        }
        Command::CheckModel { probe } => {
            let plan = plan_runtime(&cfg)?;
            println!("model:   {}", plan.model_id);
            println!("backend: {}", plan.format.name());
            println!("device:  {}", plan.device);
            match &plan.base_url {
                Some(url) => println!("engine:  attach to {}", url),
                None => println!("engine:  spawn on {}:{}", plan.host, plan.port),
            }
            if probe {
                let router = BackendRouter::from_config(&cfg)?;
                router.ensure_loaded().await?;
                println!("health:  {}", router.health_check().await?);
                router.unload().await;
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
