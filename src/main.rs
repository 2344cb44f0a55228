use anyhow::Context;
use smtp_rs::config::Config;
use smtp_rs::smtp::SmtpServer;
use smtp_rs::store::MailStore;
use std::io::LineWriter;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/server.json".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("failed to load {}", config_path))?
    } else {
        eprintln!(
            "Warning: {} not found, settings are set to default values",
            config_path
        );
        Config::default()
    };

    init_logging(&config)?;

    info!("Starting smtp-rs");
    info!("  Listening on: {}", config.listen_addr());
    info!("  Host: {}", config.server.name);
    info!("  Idle timeout: {}s", config.communication.socket_timeout);

    let mut store = MailStore::connect(
        &config.storage.database_url,
        &config.server.name,
        config.storage.pool_size,
    )
    .await
    .context("failed to open mail store")?;

    if config.storage.write_behind {
        store
            .enable_write_behind(
                &config.storage.database_url,
                config.storage.write_queue_size,
                Duration::from_millis(config.storage.flush_interval_ms),
            )
            .await
            .context("failed to start write-behind writer")?;
    }

    let store = Arc::new(store);
    let server = SmtpServer::new(config, store.clone()).context("failed to initialise server")?;

    // Interrupt converts to a clean shutdown through the cancellation token
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await.context("server failed")?;
    store.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Wires tracing to stderr or to the configured log file. A nonzero `flush`
/// writes through on every event; otherwise file output is line-buffered.
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.logging.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.logging.filename {
        Some(filename) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)
                .with_context(|| format!("failed to open log file {}", filename))?;

            if config.logging.flush != 0 {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(LineWriter::new(file)))
                    .init();
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    Ok(())
}
