//! Process wiring: starts every configured listener and stops them again.

use crate::config::{Config, ListenerConfig};
use crate::metrics::build_router;
use crate::tls;
use anyhow::{Context, Result};
use quokka_smtp::{Authenticator, DenyAll, InMemoryQueue, Metrics, Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// A running Quokka instance.
pub struct Quokka {
    servers: Vec<Server>,
    addresses: Vec<(&'static str, SocketAddr)>,
    metrics: Arc<Metrics>,
    queue: Arc<InMemoryQueue>,
    tasks: JoinSet<()>,
    http_shutdown: Option<oneshot::Sender<()>>,
}

impl Quokka {
    /// Binds every configured listener and starts serving in the background.
    ///
    /// All sockets are bound before this returns, so a port conflict fails
    /// startup instead of surfacing later in a background task.
    pub async fn start(config: &Config) -> Result<Self> {
        let tls = match &config.tls {
            Some(paths) => {
                info!("initializing tls configuration");
                Some(tls::load_acceptor(&paths.cert, &paths.key).context("tls")?)
            }
            None => None,
        };

        let credentials = config.credentials();
        let authenticator: Arc<dyn Authenticator> = if credentials.is_empty() {
            warn!("no auth users configured, AUTH will always be rejected");
            Arc::new(DenyAll)
        } else {
            info!(users = credentials.len(), "loaded auth users");
            Arc::new(credentials)
        };

        let mut app = Self {
            servers: Vec::new(),
            addresses: Vec::new(),
            metrics: Arc::new(Metrics::new().context("metrics")?),
            queue: Arc::new(InMemoryQueue::new()),
            tasks: JoinSet::new(),
            http_shutdown: None,
        };

        let smtp_listeners: [(&'static str, &Option<ListenerConfig>, ServerConfig); 3] = [
            ("smtp-relay", &config.smtp_relay, config.relay_server_config()),
            ("smtp-submission", &config.smtp_submission, config.submission_server_config()),
            ("smtp-submissions", &config.smtp_submissions, config.submissions_server_config()),
        ];

        for (name, listener, server_config) in smtp_listeners {
            let Some(listener) = listener else {
                continue;
            };

            let mut server = Server::new(server_config)
                .with_authenticator(authenticator.clone())
                .with_queue(app.queue.clone())
                .with_metrics(app.metrics.clone());
            if let Some(acceptor) = &tls {
                server = server.with_tls(acceptor.clone());
            }

            let tcp = app.bind(name, &listener.address).await?;
            let serving = server.clone();
            app.tasks.spawn(async move {
                if let Err(e) = serving.serve(tcp).await {
                    error!(server = name, error = %e, "smtp server failed");
                }
            });
            app.servers.push(server);
        }

        if let Some(imap) = &config.imap {
            warn!(address = %imap.address, "imap is not supported yet, listener ignored");
        }

        if let Some(metrics) = &config.metrics {
            let tcp = app.bind("metrics", &metrics.address).await?;
            let router = build_router(app.metrics.clone());
            let (tx, rx) = oneshot::channel::<()>();
            app.http_shutdown = Some(tx);
            app.tasks.spawn(async move {
                let shutdown = async {
                    let _ = rx.await;
                };
                if let Err(e) = axum::serve(tcp, router).with_graceful_shutdown(shutdown).await {
                    error!(error = %e, "metrics server failed");
                }
            });
        }

        Ok(app)
    }

    async fn bind(&mut self, name: &'static str, address: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("{name}: failed to bind {address}"))?;
        let local = listener.local_addr()?;
        info!(address = %local, "starting {name} server");
        self.addresses.push((name, local));
        Ok(listener)
    }

    /// Bound address of a listener, by its configuration section name.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, addr)| *addr)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<InMemoryQueue> {
        &self.queue
    }

    /// Closes every listener and waits for open sessions to finish.
    pub async fn shutdown(mut self) {
        for server in &self.servers {
            server.close();
        }
        if let Some(tx) = self.http_shutdown.take() {
            let _ = tx.send(());
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "server task failed");
            }
        }
        info!("all servers stopped");
    }
}
