//! Per-connection SMTP dialogue.

use crate::auth::Credentials;
use crate::connection::{Connection, Line, MAX_COMMAND_LINE, MAX_TEXT_LINE, Stream};
use crate::error::{SmtpError, SmtpResult};
use crate::parser::{AuthCommand, Command, MailCommand, RecipientCommand};
use crate::queue::Envelope;
use crate::reply::Reply;
use crate::server::Shared;
use base64::{Engine, engine::general_purpose::STANDARD};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// SASL responses may be longer than command lines (RFC 4954 §4).
const MAX_SASL_LINE: usize = 12288;

/// What the command loop wants the session to do next.
enum Flow {
    Continue,
    Quit,
    StartTls,
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
    tls: bool,
    authenticated_as: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<Shared>,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
        tls: bool,
    ) -> Self {
        Self {
            shared,
            peer,
            shutdown,
            tls,
            authenticated_as: None,
            mail_from: None,
            rcpt_to: Vec::new(),
        }
    }

    /// Greets the client and serves commands until QUIT, EOF, timeout or
    /// server shutdown.
    pub(crate) async fn run(mut self, stream: Stream) -> SmtpResult<()> {
        let mut conn = Connection::new(stream);
        conn.write_reply(&Reply::service_ready(self.domain())).await?;

        loop {
            let flow = match self.serve(&mut conn).await {
                Ok(flow) => flow,
                Err(SmtpError::Timeout) => {
                    debug!(peer = %self.peer, "session timed out");
                    let _ = conn.write_reply(&Reply::timeout(self.domain())).await;
                    return Ok(());
                }
                Err(SmtpError::ServerClosed) => {
                    debug!(peer = %self.peer, "closing session for server shutdown");
                    let _ = conn.write_reply(&Reply::shutting_down(self.domain())).await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match flow {
                Flow::StartTls => conn = self.start_tls(conn).await?,
                Flow::Quit | Flow::Continue => return Ok(()),
            }
        }
    }

    fn domain(&self) -> &str {
        &self.shared.config.domain
    }

    async fn serve(&mut self, conn: &mut Connection) -> SmtpResult<Flow> {
        loop {
            let Some(line) = self.next_command(conn).await? else {
                return Ok(Flow::Quit);
            };
            self.shared.record(|m| m.commands_total.inc());

            match self.dispatch(conn, &line).await? {
                Flow::Continue => {}
                flow => return Ok(flow),
            }
        }
    }

    /// Reads one line, giving up with [`SmtpError::ServerClosed`] as soon as
    /// the server is closed. Every read of the dialogue goes through here.
    async fn read_line(
        &mut self,
        conn: &mut Connection,
        limit: usize,
        timeout: Duration,
    ) -> SmtpResult<Line> {
        if *self.shutdown.borrow_and_update() {
            return Err(SmtpError::ServerClosed);
        }

        tokio::select! {
            read = conn.read_line(limit, timeout) => read,
            changed = self.shutdown.changed() => match changed {
                Ok(()) => Err(SmtpError::ServerClosed),
                // The server is gone without closing; nothing can close us now.
                Err(_) => conn.read_line(limit, timeout).await,
            },
        }
    }

    /// Waits for the next command line. `None` means the session is over.
    async fn next_command(&mut self, conn: &mut Connection) -> SmtpResult<Option<String>> {
        let timeout = self.shared.config.timeouts.command;

        loop {
            match self.read_line(conn, MAX_COMMAND_LINE, timeout).await? {
                Line::Text(bytes) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Line::TooLong => conn.write_reply(&Reply::line_too_long()).await?,
                Line::Eof => return Ok(None),
            }
        }
    }

    async fn dispatch(&mut self, conn: &mut Connection, line: &str) -> SmtpResult<Flow> {
        let command = Command::split(line);

        let reply = match command.verb.as_str() {
            "EHLO" => self.handle_ehlo(),
            "HELO" => self.handle_helo(),
            "MAIL" => self.handle_mail(line),
            "RCPT" => self.handle_rcpt(line),
            "RSET" => {
                self.reset();
                Reply::ok()
            }
            "NOOP" => Reply::ok(),
            "QUIT" => {
                conn.write_reply(&Reply::closing(self.domain())).await?;
                return Ok(Flow::Quit);
            }
            "DATA" => self.handle_data(conn).await?,
            "AUTH" => self.handle_auth(conn, line).await?,
            "STARTTLS" => match self.check_starttls() {
                Ok(()) => {
                    conn.write_reply(&Reply::ready_to_start_tls()).await?;
                    return Ok(Flow::StartTls);
                }
                Err(reply) => reply,
            },
            _ => Reply::command_unrecognized(),
        };

        conn.write_reply(&reply).await?;
        Ok(Flow::Continue)
    }

    fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }

    fn requires_authentication(&self) -> bool {
        self.shared.config.auth_mandatory && self.authenticated_as.is_none()
    }

    fn auth_offered(&self) -> bool {
        (self.tls || !self.shared.config.auth_encrypted) && self.authenticated_as.is_none()
    }

    fn handle_ehlo(&mut self) -> Reply {
        self.reset();

        let mut lines = vec![format!("{} Hello, nice to meet you", self.domain())];
        if self.auth_offered() {
            lines.push("AUTH PLAIN".to_string());
        }
        lines.push("ENHANCEDSTATUSCODES".to_string());
        lines.push("PIPELINING".to_string());
        lines.push(format!("SIZE {}", self.shared.config.max_message_size));
        if !self.tls && self.shared.tls.is_some() {
            lines.push("STARTTLS".to_string());
        }

        Reply::multiline(250, lines)
    }

    fn handle_helo(&mut self) -> Reply {
        self.reset();
        Reply::new(250, format!("{} Hello, nice to meet you", self.domain()))
    }

    fn handle_mail(&mut self, line: &str) -> Reply {
        if self.requires_authentication() {
            return Reply::authentication_required();
        }
        if self.mail_from.is_some() {
            return Reply::bad_sequence();
        }

        let Ok(mail) = MailCommand::parse(line) else {
            return Reply::syntax_error();
        };
        if mail
            .declared_size()
            .is_some_and(|size| size > self.shared.config.max_message_size as u64)
        {
            return Reply::message_too_big();
        }

        debug!(peer = %self.peer, from = %mail.reverse_path, "mail transaction started");
        self.mail_from = Some(mail.reverse_path);
        Reply::sender_ok()
    }

    fn handle_rcpt(&mut self, line: &str) -> Reply {
        if self.requires_authentication() {
            return Reply::authentication_required();
        }
        if self.mail_from.is_none() {
            return Reply::bad_sequence();
        }

        let Ok(rcpt) = RecipientCommand::parse(line) else {
            return Reply::syntax_error();
        };

        self.rcpt_to.push(rcpt.forward_path);
        Reply::recipient_ok()
    }

    /// Receives message content after `354` and returns the final reply.
    async fn handle_data(&mut self, conn: &mut Connection) -> SmtpResult<Reply> {
        if self.requires_authentication() {
            return Ok(Reply::authentication_required());
        }
        let Some(mail_from) = self.mail_from.clone() else {
            return Ok(Reply::bad_sequence());
        };
        if self.rcpt_to.is_empty() {
            return Ok(Reply::bad_sequence());
        }

        conn.write_reply(&Reply::start_mail_input()).await?;

        let max = self.shared.config.max_message_size;
        let timeout = self.shared.config.timeouts.data_block;
        let mut data = Vec::new();
        let mut oversize = false;
        let mut long_line = false;

        loop {
            let line = match self.read_line(conn, MAX_TEXT_LINE, timeout).await? {
                Line::Text(line) => line,
                Line::TooLong => {
                    long_line = true;
                    continue;
                }
                Line::Eof => return Err(SmtpError::ConnectionClosed),
            };

            if line == b"." {
                break;
            }
            if oversize {
                continue;
            }

            let content = line.strip_prefix(b".").unwrap_or(&line[..]);
            if data.len() + content.len() + 2 > max {
                oversize = true;
                data = Vec::new();
                continue;
            }
            data.extend_from_slice(content);
            data.extend_from_slice(b"\r\n");
        }

        let rcpt_to = std::mem::take(&mut self.rcpt_to);
        self.reset();

        if long_line || oversize {
            self.shared.record(|m| m.messages_rejected_total.inc());
            debug!(peer = %self.peer, long_line, oversize, "message rejected");
            return Ok(if long_line {
                Reply::line_too_long()
            } else {
                Reply::message_too_big()
            });
        }

        let mut envelope = Envelope::new(mail_from, rcpt_to, data);
        envelope.peer = Some(self.peer);
        envelope.authenticated_as = self.authenticated_as.clone();

        let (id, size, recipients) = (envelope.id, envelope.data.len(), envelope.rcpt_to.len());
        match self.shared.queue.enqueue(envelope).await {
            Ok(()) => {
                self.shared.record(|m| m.messages_accepted_total.inc());
                info!(peer = %self.peer, %id, size, recipients, "message accepted");
                Ok(Reply::message_accepted())
            }
            Err(e) => {
                self.shared.record(|m| m.messages_rejected_total.inc());
                warn!(peer = %self.peer, error = %e, "failed to queue message");
                Ok(Reply::local_error())
            }
        }
    }

    fn check_starttls(&self) -> Result<(), Reply> {
        if self.tls {
            return Err(Reply::bad_sequence());
        }
        if self.shared.tls.is_none() {
            return Err(Reply::tls_not_available());
        }
        Ok(())
    }

    /// Upgrades the connection after `220 Ready to start TLS`. The session
    /// starts over: the client must EHLO and AUTH again (RFC 3207 §4.2).
    async fn start_tls(&mut self, conn: Connection) -> SmtpResult<Connection> {
        let Stream::Plain(tcp) = conn.into_stream() else {
            return Err(SmtpError::Tls("connection is already encrypted".into()));
        };
        let acceptor = self
            .shared
            .tls
            .clone()
            .ok_or(SmtpError::MissingTlsConfig)?;

        let stream = tokio::time::timeout(
            self.shared.config.timeouts.command,
            Stream::accept_tls(tcp, &acceptor),
        )
        .await
        .map_err(|_| SmtpError::Timeout)??;

        self.shared.record(|m| m.tls_handshakes_total.inc());
        debug!(peer = %self.peer, "tls established");

        self.reset();
        self.authenticated_as = None;
        self.tls = true;
        Ok(Connection::new(stream))
    }

    async fn handle_auth(&mut self, conn: &mut Connection, line: &str) -> SmtpResult<Reply> {
        if self.shared.config.auth_encrypted && !self.tls {
            return Ok(Reply::starttls_first());
        }
        if self.authenticated_as.is_some() || self.mail_from.is_some() {
            return Ok(Reply::bad_sequence());
        }

        let Ok(auth) = AuthCommand::parse(line) else {
            return Ok(Reply::syntax_error());
        };
        if auth.mechanism != "PLAIN" {
            return Ok(Reply::unrecognized_mechanism());
        }

        let response = match auth.initial_response {
            Some(response) => response,
            None => {
                conn.write_reply(&Reply::bare(334)).await?;
                let timeout = self.shared.config.timeouts.command;
                match self.read_line(conn, MAX_SASL_LINE, timeout).await? {
                    Line::Text(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Line::TooLong => return Ok(Reply::line_too_long()),
                    Line::Eof => return Err(SmtpError::ConnectionClosed),
                }
            }
        };

        let response = response.trim();
        if response == "*" {
            return Ok(Reply::authentication_cancelled());
        }

        let decoded = if response == "=" {
            Vec::new()
        } else {
            match STANDARD.decode(response) {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "undecodable sasl response");
                    return Ok(Reply::cannot_decode_response());
                }
            }
        };

        let Some(credentials) = Credentials::from_plain(&decoded) else {
            return Ok(Reply::syntax_error());
        };

        if self.shared.authenticator.authenticate(&credentials).await {
            self.shared.record(|m| m.auth_success_total.inc());
            info!(peer = %self.peer, user = %credentials.authcid, "authenticated");
            self.authenticated_as = Some(credentials.authcid);
            Ok(Reply::authentication_succeeded())
        } else {
            self.shared.record(|m| m.auth_failure_total.inc());
            warn!(peer = %self.peer, user = %credentials.authcid, "authentication failed");
            Ok(Reply::invalid_credentials())
        }
    }
}
