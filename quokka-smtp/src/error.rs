//! Error types for the SMTP layer.

use thiserror::Error;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Errors that can occur while serving SMTP.
#[derive(Debug, Error)]
pub enum SmtpError {
    /// Socket or listener error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or TLS configuration error.
    #[error("tls error: {0}")]
    Tls(String),

    /// The server has been closed and cannot serve again.
    #[error("smtp: server closed")]
    ServerClosed,

    /// Implicit TLS was requested without certificates.
    #[error("smtp: missing server TLS configuration")]
    MissingTlsConfig,

    /// The peer did not send anything within the allowed time.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A password could not be hashed.
    #[error("password hash error: {0}")]
    PasswordHash(String),

    /// The message queue refused the message.
    #[error("queue error: {0}")]
    Queue(String),
}
