//! SMTP protocol engine and server for Quokka.
//!
//! Implements the server side of ESMTP (RFC 5321) for the three mail
//! listeners a self-hosted mail server exposes:
//! - relay (port 25), where other MTAs hand over mail
//! - submission (port 587, RFC 6409), plaintext with STARTTLS
//! - submissions (port 465, RFC 8314), TLS from the first byte
//!
//! # Architecture
//!
//! - **Parser**: Turns `MAIL`, `RCPT` and `AUTH` command lines into typed values
//! - **Reply**: Formats numeric replies with enhanced status codes
//! - **Connection**: Line-oriented, bounded, timed reads over TCP or TLS
//! - **Session**: Per-connection state machine driving one SMTP dialogue
//! - **Server**: Accept loop, TLS termination and graceful shutdown
//! - **Auth / Queue**: Seams for credential checks and accepted mail
//!
//! # Example
//!
//! ```no_run
//! use quokka_smtp::{Server, ServerConfig};
//!
//! # async fn run() -> quokka_smtp::SmtpResult<()> {
//! let server = Server::new(ServerConfig::relay("mx.example.org"));
//! server.listen_and_serve("0.0.0.0:25").await
//! # }
//! ```

pub mod auth;
mod connection;
mod error;
pub mod metrics;
pub mod parser;
pub mod queue;
pub mod reply;
mod server;
mod session;

pub use auth::{
    Authenticator, Credentials, DenyAll, StaticCredentials, hash_password, is_password_hash,
};
pub use error::{SmtpError, SmtpResult};
pub use metrics::Metrics;
pub use parser::{AuthCommand, Command, MailCommand, ParseError, RecipientCommand};
pub use queue::{Envelope, INMEMORY_PROVIDER, InMemoryQueue, MessageQueue};
pub use reply::Reply;
pub use server::{DEFAULT_MAX_MESSAGE_SIZE, SHUTDOWN_GRACE_PERIOD, Server, ServerConfig, Timeouts};
