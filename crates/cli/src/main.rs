mod cli;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use wagate_channels::BridgeConnector;
use wagate_core::{Config, ConfigLoader, ConfigValidator, RunMode, WagateError};
use wagate_gateway::GatewayServer;
use wagate_session::{FileSessionStore, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.is_dev() {
        "wagate=debug,wagate_gateway=debug,wagate_channels=debug,info"
    } else {
        "wagate=info,wagate_gateway=info,wagate_channels=info,warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    // Handle ConfigSample immediately without loading config
    if let Some(Commands::ConfigSample { output }) = &cli.command {
        let path = output
            .clone()
            .unwrap_or_else(|| PathBuf::from("./wagate.sample.yaml"));
        Config::sample().save(&path)?;
        println!("Sample config written to {:?}", path);
        return Ok(());
    }

    let mut config = ConfigLoader::load(cli.config_path.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve {
        listen: None,
        dev: false,
    }) {
        Commands::ListSessions => {
            let store = open_store(&config)?;
            let ids = store
                .list_session_ids()
                .await
                .map_err(|e| WagateError::session("list", e.to_string()))?;
            if ids.is_empty() {
                println!("No stored sessions");
            } else {
                for id in ids {
                    println!("  • {}", id);
                }
            }
        }
        Commands::DeleteSession { session_id } => {
            let store = open_store(&config)?;
            store
                .remove_session(&session_id)
                .await
                .map_err(|e| WagateError::session("delete", e.to_string()))?;
            println!("Session deleted: {}", session_id);
        }
        Commands::Serve { listen, dev } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if dev {
                config.server.env = RunMode::Dev;
            }
            serve(config).await?;
        }
        // Handled before config load.
        Commands::ConfigSample { .. } => {}
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<FileSessionStore, WagateError> {
    FileSessionStore::new(config.storage.sessions_dir())
        .map_err(|e| WagateError::session("open", e.to_string()))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    ConfigValidator::validate(&config)?;

    info!("wagate starting");
    info!("  listen: {}", config.server.listen_addr);
    info!("  bridge: {}", config.transport.bridge_url);
    info!("  storage: {:?}", config.storage.root);
    info!("  mode: {:?}", config.server.env);
    if config.server.env == RunMode::Dev {
        tracing::warn!("dev mode: TLS certificates of outbound calls are not verified");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let connector = Arc::new(BridgeConnector::new(config.transport.bridge_url.clone()));
    let server = GatewayServer::new(config, connector, shutdown)?;
    server
        .start()
        .await
        .map_err(|e| WagateError::startup("gateway", e.to_string()))?;
    info!("wagate stopped");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
