use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

mod cli;
mod commands;
mod wiring;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth_server=info,hearth_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config / HEARTH_CONFIG > ~/.hearth/hearth.toml, HEARTH_* env on top
    let config = hearth_core::HearthConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        hearth_core::HearthConfig::default()
    });

    let service = wiring::build_service(&config)?;

    match cli.command {
        Command::Serve => {
            service.start().await;
            info!(instance_id = %service.instance_id(), "hearth scheduler running");
            shutdown_signal().await;
            service.stop().await;
        }
        Command::Rules(command) => commands::handle_rule_command(&service, command).await?,
        Command::RunNow { user_id } => commands::run_now(&service, &user_id).await?,
        Command::Jobs => commands::show_jobs(&service).await?,
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
