use color_eyre::{eyre::eyre, Result};
use homeline::config::AppConfig;
use homeline::integrations::{IntegrationSupervisor, Registry};
use homeline::persistence::StateStore;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Upper bound for publishing offline presence on every session
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let loaded = AppConfig::load(&config_path).await?;
    let config = loaded.clone().unwrap_or_default();
    setup_logging_env(config.debug);
    match loaded {
        Some(_) => info!(
            "Loaded config from {} ({} integration(s))",
            config_path.display(),
            config.integrations.len()
        ),
        None => warn!("No config file at {}, using defaults", config_path.display()),
    }

    let store = StateStore::open(&config.state_path)
        .await
        .map_err(|e| eyre!("Failed to open state store: {}", e))?;
    info!("Persisting state to {}", config.state_path);

    let mut supervisor = IntegrationSupervisor::new(
        Registry::builtin(),
        config.mqtt.clone(),
        &config.device_id,
        store,
    );
    supervisor.start(&config.integrations).await;
    for (id, status) in supervisor.statuses() {
        info!("{}: {:?}", id, status);
    }

    wait_for_signal().await?;
    info!("Termination signal received");

    supervisor.shutdown(SHUTDOWN_DEADLINE).await;
    info!("Bye");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging_env(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| eyre!("Failed to install SIGTERM handler: {}", e))?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))
}
