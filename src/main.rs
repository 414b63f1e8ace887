use clap::{Parser, Subcommand};
use sigtrade::config::{AppConfig, LoggingConfig};
use sigtrade::coordinator::TradeCoordinator;
use sigtrade::domain::ExchangeKind;
use sigtrade::error::Result;
use sigtrade::exchange::build_adapter;
use sigtrade::notify::Notifier;
use sigtrade::persistence::PostgresStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sigtrade", about = "Signal-driven futures trade executor")]
struct Cli {
    /// Directory holding default.toml overrides.
    #[arg(long, env = "SIGTRADE_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator: recover open positions, consume fill
    /// streams, and accept signals.
    Run,
    /// Load and validate the configuration, then exit.
    CheckConfig,
    /// Apply pending database migrations, then exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config_dir)?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Run => run(config).await,
        Commands::CheckConfig => check_config(&config),
        Commands::Migrate => migrate(&config).await,
    }
}

async fn run(config: AppConfig) -> Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("config error: {}", e);
        }
        return Err(sigtrade::error::SigtradeError::Config(
            config::ConfigError::Message(errors.join("; ")),
        ));
    }

    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    let store = Arc::new(store);

    let notifier = Notifier::new();
    let coordinator = Arc::new(TradeCoordinator::new(
        config.clone(),
        store,
        notifier,
    ));

    for (kind, creds) in [
        (ExchangeKind::Binance, config.venues.binance.as_ref()),
        (ExchangeKind::Okx, config.venues.okx.as_ref()),
    ] {
        let Some(creds) = creds else { continue };
        let adapter = build_adapter(kind, &config.venues)?;
        coordinator
            .register_account(kind, "default", adapter, creds.min_request_interval_ms)
            .await;
        Arc::clone(&coordinator).spawn_fill_stream(kind, "default".to_string());
    }

    let recovered = coordinator.recover().await?;
    info!(recovered, "recovery complete");

    Arc::clone(&coordinator).spawn_risk_task();
    info!("sigtrade running, press Ctrl+C to stop");

    shutdown_signal().await;
    info!("shutting down");
    Ok(())
}

fn check_config(config: &AppConfig) -> Result<()> {
    match config.validate() {
        Ok(()) => {
            info!("configuration is valid");
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                error!("config error: {}", e);
            }
            Err(sigtrade::error::SigtradeError::Config(
                config::ConfigError::Message(errors.join("; ")),
            ))
        }
    }
}

async fn migrate(config: &AppConfig) -> Result<()> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    info!("migrations applied");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", logging.level)));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => warn!("terminate signal received"),
    }
}
