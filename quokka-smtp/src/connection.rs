//! Line-oriented transport over plain TCP or TLS.

use crate::error::{SmtpError, SmtpResult};
use crate::reply::Reply;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

/// Command lines including CRLF (RFC 5321 §4.5.3.1.4).
pub(crate) const MAX_COMMAND_LINE: usize = 512;

/// Text lines including CRLF (RFC 5321 §4.5.3.1.6).
pub(crate) const MAX_TEXT_LINE: usize = 1000;

/// A socket that may or may not have been upgraded to TLS.
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    /// Runs the server side of a TLS handshake over a plain socket.
    pub(crate) async fn accept_tls(tcp: TcpStream, acceptor: &TlsAcceptor) -> SmtpResult<Self> {
        let tls = acceptor
            .accept(tcp)
            .await
            .map_err(|e| SmtpError::Tls(e.to_string()))?;
        Ok(Stream::Tls(Box::new(tls)))
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Outcome of reading one line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line {
    /// Line content without the terminating CRLF (or bare LF).
    Text(Vec<u8>),
    /// The line exceeded the limit; it has been consumed and discarded.
    TooLong,
    /// The peer closed the connection.
    Eof,
}

/// Buffered reader/writer used by a session.
pub(crate) struct Connection {
    io: BufReader<Stream>,
}

impl Connection {
    pub(crate) fn new(stream: Stream) -> Self {
        Self {
            io: BufReader::new(stream),
        }
    }

    /// Returns the underlying socket. Bytes already buffered but not yet
    /// read are dropped, which STARTTLS relies on (RFC 3207 §4.2).
    pub(crate) fn into_stream(self) -> Stream {
        self.io.into_inner()
    }

    pub(crate) async fn write_reply(&mut self, reply: &Reply) -> SmtpResult<()> {
        self.io.write_all(reply.encode().as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Reads a line of at most `limit` bytes (terminator included) within
    /// `timeout`.
    pub(crate) async fn read_line(&mut self, limit: usize, timeout: Duration) -> SmtpResult<Line> {
        tokio::time::timeout(timeout, self.read_line_inner(limit))
            .await
            .map_err(|_| SmtpError::Timeout)?
    }

    async fn read_line_inner(&mut self, limit: usize) -> SmtpResult<Line> {
        let mut line = Vec::new();
        let mut overflow = false;

        loop {
            let available = self.io.fill_buf().await?;
            if available.is_empty() {
                return Ok(Line::Eof);
            }

            let (consumed, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };

            if !overflow {
                if line.len() + consumed > limit {
                    overflow = true;
                    line.clear();
                } else {
                    line.extend_from_slice(&available[..consumed]);
                }
            }
            self.io.consume(consumed);

            if complete {
                break;
            }
        }

        if overflow {
            return Ok(Line::TooLong);
        }

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Line::Text(line))
    }
}
