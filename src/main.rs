//! plcgw CLI Entry Point
//!
//! Validates configurations, lists built-in connection kinds, prints an
//! example configuration and runs a gateway (and optionally a session
//! server) from a configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use plcgw::core::metadata::get_driver_registry;
use plcgw::gateway::config::EXAMPLE_CONFIG;
use plcgw::gateway::{build_runtime, ConnectionFactory, GatewayConfig, Handler, ListenerRegistry};
use plcgw::session::{GatewayClient, GatewayServer, WsConnector, WS_PATH};
use plcgw::store::MemoryStore;

/// PLC Gateway - logical address dispatch and remote sessions
#[derive(Parser, Debug)]
#[command(name = "plcgw", version, about, long_about = None)]
struct Cli {
    /// Debug-level logging for this crate
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a configuration file
    Check {
        /// Path to the TOML configuration
        config: PathBuf,
    },

    /// List built-in connection kinds
    ListConnections,

    /// Print an example configuration
    Example,

    /// Run the gateway until interrupted
    Run {
        /// Path to the TOML configuration
        config: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,plcgw=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Check { config } => check(&config),
        Commands::ListConnections => {
            list_connections();
            Ok(())
        }
        Commands::Example => {
            print!("{}", EXAMPLE_CONFIG);
            Ok(())
        }
        Commands::Run { config } => run(&config).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn check(path: &Path) -> plcgw::Result<()> {
    let config = GatewayConfig::from_file(path)?;
    let runtime = build_runtime(
        &config,
        &ConnectionFactory::new(),
        Arc::new(ListenerRegistry::new()),
        Default::default(),
    )?;

    println!("{}: OK", path.display());
    println!("  connections:   {}", runtime.connection_ids().len());
    println!("  addresses:     {}", runtime.addresses().count());
    println!("  notifications: {}", runtime.notifications().len());
    if let Some(session) = &config.session {
        println!(
            "  session:       {} -> {}",
            session.plc_id,
            session.server.as_deref().unwrap_or("(no server)")
        );
    }
    if let Some(server) = &config.server {
        println!("  server:        listening on ws://{}{}", server.listen, WS_PATH);
    }
    Ok(())
}

fn list_connections() {
    println!("Built-in connection kinds:");
    println!();

    for driver in get_driver_registry().drivers() {
        println!("  {} ({})", driver.name, driver.display_name);
        println!("    {}", driver.description);
        for param in &driver.parameters {
            let default = param
                .default_value
                .as_ref()
                .map(|v| format!(" [default: {}]", v))
                .unwrap_or_default();
            println!("      - {}: {}{}", param.name, param.description, default);
        }
        println!();
    }
}

async fn run(path: &Path) -> plcgw::Result<()> {
    let config = GatewayConfig::from_file(path)?;

    let handler = Arc::new(Handler::new(Arc::new(MemoryStore::new())));
    handler.configure(&config).await?;
    handler.start().await?;

    let server = config.server.clone().map(|settings| {
        let server = Arc::new(GatewayServer::from_settings(settings));
        tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                if let Err(e) = server.run().await {
                    tracing::error!(error = %e, "Gateway server stopped");
                }
            }
        })
    });

    let client = match &config.session {
        Some(settings) => match &settings.server {
            Some(url) => {
                let connector =
                    WsConnector::new(url.clone()).with_max_message_size(settings.max_message_size);
                let client = GatewayClient::new(
                    settings.clone(),
                    Arc::clone(&handler),
                    Arc::new(connector),
                );
                client.start()?;
                Some(client)
            }
            None => {
                tracing::warn!(plc_id = %settings.plc_id, "Session configured without server address");
                None
            }
        },
        None => None,
    };

    tracing::info!(config = %path.display(), "Gateway running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if let Some(client) = client {
        client.stop().await;
    }
    if let Some(server) = server {
        server.abort();
    }
    handler.stop().await?;
    tracing::info!("Gateway stopped");
    Ok(())
}
