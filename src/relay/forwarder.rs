//! Delivery of accepted messages to the MX servers of remote recipients.
//!
//! For each recipient: resolve the MX list, then walk it in priority order,
//! replaying an SMTP conversation over an implicit-TLS submission connection.
//! The first MX that takes the message ends the walk. No internal retries;
//! the caller decides what a partial outcome means.

use crate::error::{MailError, Result};
use crate::message::MailMessage;
use crate::relay::dns;
use crate::security::tls;
use rustls::ServerName;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Implicit-TLS submission port used for outbound delivery.
const RELAY_PORT: u16 = 465;

/// Per-MX connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a forwarding attempt across all recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Every recipient was accepted by some MX host.
    Delivered,
    /// At least one recipient was delivered; `failed` lists the rest.
    Partial { failed: Vec<String> },
    /// No recipient could be delivered.
    AllFailed,
}

pub struct MailForwarder {
    server_domain: String,
}

impl MailForwarder {
    /// `server_domain` is our identity in the outbound HELO.
    pub fn new(server_domain: String) -> Self {
        Self { server_domain }
    }

    /// Attempts delivery to every recipient of the message.
    pub async fn forward(&self, message: &MailMessage) -> ForwardOutcome {
        let mut failed = Vec::new();
        let mut delivered = 0usize;

        for recipient in &message.to {
            let address = recipient.address();

            let domain = match dns::extract_domain(address) {
                Some(domain) if !domain.is_empty() => domain,
                _ => {
                    warn!("Invalid recipient address for relay: {}", address);
                    failed.push(address.to_string());
                    continue;
                }
            };

            let mx_records = match dns::resolve_mx(domain).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("Cannot resolve MX for {}: {}", domain, e);
                    failed.push(address.to_string());
                    continue;
                }
            };

            let mut sent = false;
            for mx in &mx_records {
                debug!("Trying MX {} (priority {}) for {}", mx.host, mx.priority, address);
                match self
                    .deliver_via(&mx.host, message.from.address(), address, &message.body)
                    .await
                {
                    Ok(()) => {
                        info!("Delivered mail for {} via {}", address, mx.host);
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        warn!("Delivery via {} failed: {}", mx.host, e);
                    }
                }
            }

            if sent {
                delivered += 1;
            } else {
                failed.push(address.to_string());
            }
        }

        match (delivered, failed.is_empty()) {
            (_, true) => ForwardOutcome::Delivered,
            (0, false) => ForwardOutcome::AllFailed,
            (_, false) => ForwardOutcome::Partial { failed },
        }
    }

    /// Opens a TLS connection to one MX host and replays the conversation.
    async fn deliver_via(
        &self,
        mx_host: &str,
        sender: &str,
        recipient: &str,
        body: &str,
    ) -> Result<()> {
        let tcp = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((mx_host, RELAY_PORT)),
        )
        .await
        .map_err(|_| {
            MailError::SmtpProtocol(format!("Connect to {} timed out", mx_host))
        })??;

        let server_name = ServerName::try_from(mx_host)
            .map_err(|_| MailError::Tls(format!("Invalid MX host name: {}", mx_host)))?;
        let stream = tls::relay_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| MailError::Tls(format!("TLS handshake with {} failed: {}", mx_host, e)))?;

        self.replay(stream, sender, recipient, body).await
    }

    /// The SMTP conversation itself: HELO, MAIL, RCPT, DATA, body, QUIT.
    async fn replay<S>(&self, stream: S, sender: &str, recipient: &str, body: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);

        read_response(&mut stream, "220").await?;

        write_line(&mut stream, &format!("HELO {}", self.server_domain)).await?;
        read_response_2xx(&mut stream).await?;

        write_line(&mut stream, &format!("MAIL FROM:<{}>", sender)).await?;
        read_response_2xx(&mut stream).await?;

        write_line(&mut stream, &format!("RCPT TO:<{}>", recipient)).await?;
        read_response_2xx(&mut stream).await?;

        write_line(&mut stream, "DATA").await?;
        read_response(&mut stream, "354").await?;

        stream.write_all(body.as_bytes()).await?;
        if !body.ends_with("\r\n") {
            stream.write_all(b"\r\n").await?;
        }
        stream.write_all(b".\r\n").await?;
        stream.flush().await?;
        read_response_2xx(&mut stream).await?;

        write_line(&mut stream, "QUIT").await?;
        // Best effort: the message is already accepted
        let _ = read_line(&mut stream).await;

        Ok(())
    }
}

async fn write_line<S>(stream: &mut S, line: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug!("relay > {}", line);
    stream.write_all(format!("{}\r\n", line).as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_line<S>(stream: &mut BufReader<S>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        return Err(MailError::PeerClosed);
    }
    Ok(line)
}

/// Reads a complete, possibly multi-line reply.
async fn read_full_reply<S>(stream: &mut BufReader<S>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut full_response = String::new();

    loop {
        let line = read_line(stream).await?;
        debug!("relay < {}", line.trim_end());
        full_response.push_str(&line);

        // Last line of a reply has a space after the code; byte-oriented so
        // a hostile line cannot land mid-character
        if line.len() < 4 || line.as_bytes().get(3) == Some(&b' ') {
            break;
        }
    }

    Ok(full_response)
}

/// Reads a reply and checks its exact code.
async fn read_response<S>(stream: &mut BufReader<S>, expected: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let full_response = read_full_reply(stream).await?;

    if !full_response.starts_with(expected) {
        return Err(MailError::SmtpProtocol(format!(
            "Expected {}, got: {}",
            expected,
            full_response.trim_end()
        )));
    }

    Ok(full_response)
}

/// Reads a reply and accepts any 2xx-class code. The replayed conversation
/// continues on any positive completion, not just 250.
async fn read_response_2xx<S>(stream: &mut BufReader<S>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let full_response = read_full_reply(stream).await?;

    if full_response.as_bytes().first() != Some(&b'2') {
        return Err(MailError::SmtpProtocol(format!(
            "Expected 2xx, got: {}",
            full_response.trim_end()
        )));
    }

    Ok(full_response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_replay_happy_path() {
        let (client, server) = duplex(4096);
        let forwarder = MailForwarder::new("mail.example.com".to_string());

        let server_task = tokio::spawn(async move {
            let mut stream = BufReader::new(server);
            stream.write_all(b"220 remote ready\r\n").await.unwrap();

            let mut seen = Vec::new();
            for reply in [
                "250 hello\r\n",
                "250 OK\r\n",
                "250 OK\r\n",
                "354 go ahead\r\n",
            ] {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                seen.push(line);
                stream.write_all(reply.as_bytes()).await.unwrap();
            }

            // Consume body until the terminating dot
            loop {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                if line == ".\r\n" {
                    break;
                }
            }
            stream.write_all(b"250 accepted\r\n").await.unwrap();

            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            assert_eq!(line, "QUIT\r\n");
            stream.write_all(b"221 bye\r\n").await.unwrap();

            seen
        });

        forwarder
            .replay(client, "alice@mail.example.com", "bob@remote.test", "hello\r\n")
            .await
            .unwrap();

        let seen = server_task.await.unwrap();
        assert_eq!(seen[0], "HELO mail.example.com\r\n");
        assert_eq!(seen[1], "MAIL FROM:<alice@mail.example.com>\r\n");
        assert_eq!(seen[2], "RCPT TO:<bob@remote.test>\r\n");
        assert_eq!(seen[3], "DATA\r\n");
    }

    #[tokio::test]
    async fn test_replay_aborts_on_rejected_sender() {
        let (client, server) = duplex(4096);
        let forwarder = MailForwarder::new("mail.example.com".to_string());

        let server_task = tokio::spawn(async move {
            let mut stream = BufReader::new(server);
            stream.write_all(b"220 remote ready\r\n").await.unwrap();

            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap(); // HELO
            stream.write_all(b"250 hello\r\n").await.unwrap();

            line.clear();
            stream.read_line(&mut line).await.unwrap(); // MAIL FROM
            stream.write_all(b"550 no thanks\r\n").await.unwrap();
        });

        let result = forwarder
            .replay(client, "alice@mail.example.com", "bob@remote.test", "hello\r\n")
            .await;
        assert!(result.is_err());

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_accepts_any_2xx_class_reply() {
        let (client, server) = duplex(4096);
        let forwarder = MailForwarder::new("mail.example.com".to_string());

        let server_task = tokio::spawn(async move {
            let mut stream = BufReader::new(server);
            stream.write_all(b"220 remote ready\r\n").await.unwrap();

            // Positive completion codes other than 250 on every step
            for reply in [
                "250 hello\r\n",
                "252 sender accepted\r\n",
                "251 user not local, will forward\r\n",
                "354 go ahead\r\n",
            ] {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                stream.write_all(reply.as_bytes()).await.unwrap();
            }

            loop {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                if line == ".\r\n" {
                    break;
                }
            }
            stream.write_all(b"252 queued for delivery\r\n").await.unwrap();

            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            stream.write_all(b"221 bye\r\n").await.unwrap();
        });

        forwarder
            .replay(client, "alice@mail.example.com", "bob@remote.test", "hello\r\n")
            .await
            .unwrap();

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_survives_multibyte_reply_lines() {
        let (client, server) = duplex(4096);
        let forwarder = MailForwarder::new("mail.example.com".to_string());

        let server_task = tokio::spawn(async move {
            let mut stream = BufReader::new(server);
            stream.write_all(b"220 remote ready\r\n").await.unwrap();

            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap(); // HELO
            // A banner line whose fourth byte falls inside a multi-byte
            // character must not break reply framing
            stream
                .write_all("250-ok\r\na\u{20ac}bc\r\n250 done\r\n".as_bytes())
                .await
                .unwrap();

            line.clear();
            stream.read_line(&mut line).await.unwrap(); // MAIL FROM
            stream.write_all(b"550 rejected\r\n").await.unwrap();
        });

        let result = forwarder
            .replay(client, "a@b.c", "d@e.f", "x\r\n")
            .await;
        assert!(result.is_err());

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_handles_multiline_replies() {
        let (client, server) = duplex(4096);
        let forwarder = MailForwarder::new("mail.example.com".to_string());

        let server_task = tokio::spawn(async move {
            let mut stream = BufReader::new(server);
            stream.write_all(b"220 remote ready\r\n").await.unwrap();

            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap(); // HELO
            stream
                .write_all(b"250-hello\r\n250-SIZE 1000000\r\n250 OK\r\n")
                .await
                .unwrap();

            line.clear();
            stream.read_line(&mut line).await.unwrap(); // MAIL FROM
            stream.write_all(b"550 rejected\r\n").await.unwrap();
        });

        // Multi-line 250 must be consumed as one reply; the 550 then fails
        let result = forwarder
            .replay(client, "a@b.c", "d@e.f", "x\r\n")
            .await;
        assert!(result.is_err());

        server_task.await.unwrap();
    }
}
