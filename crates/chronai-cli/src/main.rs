use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use chronai_gateway::GatewayState;
use chronai_openai::ChatClient;
use chronai_scheduler::Scheduler;
use chronai_security::CredentialCipher;
use chronai_store::TaskStore;

#[derive(Parser)]
#[command(name = "chronai", about = "Scheduled AI task runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and the REST gateway
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path (overrides config)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print a configuration summary
    Health,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, db } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_serve(port, db))?;
        }
        Commands::Health => {
            let config = chronai_config::load_config().unwrap_or_default();
            println!("chronai is healthy");
            println!("  gateway: {}:{}", config.gateway.host, config.gateway.port);
            println!(
                "  auth token: {}",
                if config.gateway.auth_token.is_some() {
                    "configured"
                } else {
                    "none"
                }
            );
            match config.database.resolve_path() {
                Ok(path) => println!("  database: {}", path.display()),
                Err(e) => println!("  database: unresolved ({e})"),
            }
        }
    }

    Ok(())
}

async fn run_serve(port_override: Option<u16>, db_override: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting chronai...");

    let config = chronai_config::load_config()?;
    let key = chronai_config::ensure_encryption_key()?;
    let cipher = CredentialCipher::from_base64(&key)?;

    let db_path = match db_override {
        Some(path) => path,
        None => config.database.resolve_path()?,
    };
    let store = TaskStore::open(&db_path)?;

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        ChatClient::new(),
        cipher.clone(),
    ));
    scheduler.start().await?;

    let state = Arc::new(GatewayState {
        store,
        scheduler: scheduler.clone(),
        cipher: Arc::new(cipher),
        auth_token: config.gateway.auth_token.clone(),
    });

    let host = config.gateway.host.clone();
    let port = port_override.unwrap_or(config.gateway.port);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down chronai...");
    };

    chronai_gateway::start_gateway(state, &host, port, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    scheduler.shutdown().await;
    info!("chronai shutdown complete");
    Ok(())
}
