//! SMTP listener: accept loop, TLS termination and graceful shutdown.

use crate::auth::{Authenticator, DenyAll};
use crate::connection::Stream;
use crate::error::{SmtpError, SmtpResult};
use crate::metrics::Metrics;
use crate::queue::{InMemoryQueue, MessageQueue};
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// 25 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long a closed server waits for open sessions before aborting them.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Server-side timeouts (RFC 5321 §4.5.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for the next command.
    pub command: Duration,
    /// Waiting for each line of message content.
    pub data_block: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(5 * 60),
            data_block: Duration::from_secs(3 * 60),
        }
    }
}

/// Behaviour of one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Name announced in the greeting and closing replies.
    pub domain: String,
    /// AUTH is only offered over TLS.
    pub auth_encrypted: bool,
    /// MAIL, RCPT and DATA require a successful AUTH first.
    pub auth_mandatory: bool,
    /// TLS starts with the connection instead of via STARTTLS.
    pub implicit_tls: bool,
    pub max_message_size: usize,
    pub timeouts: Timeouts,
}

impl ServerConfig {
    /// MTA-to-MTA relay (port 25): AUTH optional, STARTTLS offered.
    pub fn relay(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            auth_encrypted: true,
            auth_mandatory: false,
            implicit_tls: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            timeouts: Timeouts::default(),
        }
    }

    /// Message submission (port 587): AUTH mandatory, after STARTTLS.
    pub fn submission(domain: impl Into<String>) -> Self {
        Self {
            auth_mandatory: true,
            ..Self::relay(domain)
        }
    }

    /// Message submission over implicit TLS (port 465).
    pub fn submissions(domain: impl Into<String>) -> Self {
        Self {
            implicit_tls: true,
            ..Self::submission(domain)
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::relay("quokka.local")
    }
}

/// State shared by every session of one listener.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) queue: Arc<dyn MessageQueue>,
    pub(crate) metrics: Option<Arc<Metrics>>,
}

impl Shared {
    pub(crate) fn record(&self, update: impl FnOnce(&Metrics)) {
        if let Some(metrics) = &self.metrics {
            update(metrics);
        }
    }
}

/// An SMTP listener.
///
/// Cloning is cheap; all clones control the same listener, so one clone can
/// [`close`](Server::close) a server another clone is serving.
#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    authenticator: Arc<dyn Authenticator>,
    queue: Arc<dyn MessageQueue>,
    metrics: Option<Arc<Metrics>>,
    shutdown_grace: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Creates a server that rejects AUTH, keeps mail in memory and records
    /// no metrics.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            tls: None,
            authenticator: Arc::new(DenyAll),
            queue: Arc::new(InMemoryQueue::new()),
            metrics: None,
            shutdown_grace: SHUTDOWN_GRACE_PERIOD,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Enables STARTTLS (or implicit TLS for submissions listeners).
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// How long [`serve`](Server::serve) waits for open sessions after
    /// [`close`](Server::close) before aborting them.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Binds `addr` and serves until [`close`](Server::close) is called.
    pub async fn listen_and_serve<A: ToSocketAddrs>(&self, addr: A) -> SmtpResult<()> {
        if self.is_closed() {
            return Err(SmtpError::ServerClosed);
        }

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until the server is closed, then
    /// waits for open sessions to finish. Sessions still open after the
    /// shutdown grace period are aborted.
    pub async fn serve(&self, listener: TcpListener) -> SmtpResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(SmtpError::ServerClosed);
        }
        if self.config.implicit_tls && self.tls.is_none() {
            return Err(SmtpError::MissingTlsConfig);
        }

        if let Ok(addr) = listener.local_addr() {
            debug!(address = %addr, domain = %self.config.domain, "smtp listener ready");
        }

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            tls: self.tls.clone(),
            authenticator: self.authenticator.clone(),
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
        });
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        sessions.spawn(handle_connection(
                            shared.clone(),
                            socket,
                            peer,
                            self.shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_join(joined);
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        debug!(open_sessions = sessions.len(), "smtp listener stopped, draining sessions");
        let drain = async {
            while let Some(joined) = sessions.join_next().await {
                log_join(joined);
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(open_sessions = sessions.len(), "sessions did not finish in time, aborting");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        Ok(())
    }

    /// Stops accepting connections and asks every session to close with a
    /// 421 reply. Calling it more than once has no further effect.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            info!(domain = %self.config.domain, "closing smtp server");
        }
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    socket: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    shared.record(Metrics::session_opened);
    let _active = ActiveSession(shared.clone());
    debug!(%peer, "session started");

    let result = async {
        let stream = match (&shared.tls, shared.config.implicit_tls) {
            (Some(acceptor), true) => {
                let stream = tokio::time::timeout(
                    shared.config.timeouts.command,
                    Stream::accept_tls(socket, acceptor),
                )
                .await
                .map_err(|_| SmtpError::Timeout)??;
                shared.record(|m| m.tls_handshakes_total.inc());
                stream
            }
            _ => Stream::Plain(socket),
        };

        Session::new(shared.clone(), peer, shutdown, stream.is_tls())
            .run(stream)
            .await
    }
    .await;

    match result {
        Ok(()) | Err(SmtpError::ConnectionClosed) => debug!(%peer, "session ended"),
        Err(e) => warn!(%peer, error = %e, "session ended with error"),
    }
}

/// Keeps `sessions_active` right when a session task is aborted.
struct ActiveSession(Arc<Shared>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.record(Metrics::session_closed);
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "session task failed");
    }
}
