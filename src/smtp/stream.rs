//! The session's byte channel: one type over plain TCP and TLS, with an
//! idle timeout on reads.
//!
//! STARTTLS swaps the variant in place; the `Upgrading` placeholder exists
//! only inside that swap and must never be observable from I/O.

use crate::error::{MailError, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

enum SmtpStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Temporary state during STARTTLS upgrade
    Upgrading,
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }
}

/// One connection's byte channel. Not thread-safe; owned by its session.
pub struct Channel {
    stream: SmtpStream,
    idle_timeout: Duration,
    open: bool,
}

impl Channel {
    pub fn new(stream: TcpStream, idle_timeout: Duration) -> Self {
        Self {
            stream: SmtpStream::Plain(stream),
            idle_timeout,
            open: true,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, SmtpStream::Tls(_))
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Writes all bytes in order. The session serialises writes.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes. Ok(0) means the peer closed. The idle
    /// deadline restarts on every call, so expiry means no bytes arrived for
    /// a full timeout window since the last successful read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;

        match timeout(self.idle_timeout, self.stream.read(buf)).await {
            Ok(Ok(n)) => {
                if n == 0 {
                    self.open = false;
                }
                Ok(n)
            }
            Ok(Err(e)) => {
                self.open = false;
                Err(e.into())
            }
            Err(_) => {
                self.open = false;
                Err(MailError::IdleTimeout)
            }
        }
    }

    /// Performs the server-side TLS handshake in place. Only valid once,
    /// on a plain channel, with no I/O in flight.
    pub async fn upgrade_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let tcp = match std::mem::replace(&mut self.stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(MailError::Tls(
                    "Channel is not in plain-TCP mode".to_string(),
                ));
            }
        };

        match acceptor.accept(tcp).await {
            Ok(tls) => {
                debug!("STARTTLS handshake completed");
                self.stream = SmtpStream::Tls(tls);
                Ok(())
            }
            Err(e) => {
                self.open = false;
                Err(MailError::Tls(format!("TLS handshake failed: {}", e)))
            }
        }
    }

    /// Orderly shutdown; in TLS mode this sends close_notify first. Errors
    /// are ignored.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
        self.open = false;
    }
}
