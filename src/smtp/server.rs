//! Listener and session dispatch.
//!
//! Accepts connections and runs each session on the runtime, bounded by a
//! semaphore sized to the configured worker count. Shutdown stops the accept
//! loop, cancels active sessions, and waits for them to drain.

use crate::config::Config;
use crate::error::Result;
use crate::relay::MailForwarder;
use crate::security::TlsConfig;
use crate::smtp::session::SmtpSession;
use crate::store::MailStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct SmtpServer {
    config: Config,
    store: Arc<MailStore>,
    forwarder: Arc<MailForwarder>,
    tls_config: Arc<TlsConfig>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    /// Builds the server and its immutable TLS context. With no certificate
    /// paths configured, a self-signed development certificate is generated.
    pub fn new(config: Config, store: Arc<MailStore>) -> Result<Self> {
        let tls_config = match (&config.server.tls_cert_path, &config.server.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                TlsConfig::from_pem_files(cert_path, key_path)?
            }
            _ => {
                warn!("No TLS certificate configured, generating a self-signed one");
                TlsConfig::self_signed(&config.server.name)?
            }
        };

        let forwarder = Arc::new(MailForwarder::new(config.server.name.clone()));

        Ok(Self {
            config,
            store,
            forwarder,
            tls_config: Arc::new(tls_config),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the accept loop and cancels active sessions.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        info!("SMTP server listening on {}", self.config.listen_addr());
        self.serve(listener).await
    }

    /// Serves on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let worker_count = self
            .config
            .thread_pool
            .max_working_threads
            .clamp(1, parallelism.max(1));
        let workers = Arc::new(Semaphore::new(worker_count));
        let idle_timeout = Duration::from_secs(self.config.communication.socket_timeout);

        info!("Serving with up to {} concurrent sessions", worker_count);

        loop {
            // A free worker slot is required before the next accept
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (socket, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            info!("New SMTP connection from {}", peer);

            let session = SmtpSession::new(
                self.store.clone(),
                self.forwarder.clone(),
                self.tls_config.clone(),
                self.config.server.name.clone(),
                self.config.server.display_name.clone(),
            );
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = session.handle(socket, idle_timeout, shutdown).await {
                    error!("Session error: {}", e);
                }
                drop(permit);
            });
        }

        // Wait for active sessions to observe the cancellation and finish
        let _draining = workers.acquire_many(worker_count as u32).await;
        info!("SMTP server stopped");
        Ok(())
    }
}
