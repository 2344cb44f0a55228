//! End-to-end SMTP conversations against a running server instance.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::ServerName;
use smtp_rs::config::Config;
use smtp_rs::security::tls::relay_connector;
use smtp_rs::smtp::SmtpServer;
use smtp_rs::store::MailStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MailStore>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

async fn start_server(socket_timeout: u64) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/mail.db?mode=rwc", dir.path().display());

    let store = Arc::new(MailStore::connect(&url, "localhost", 4).await.unwrap());

    let mut config = Config::default();
    config.communication.socket_timeout = socket_timeout;

    let server = SmtpServer::new(config, store.clone()).unwrap();
    let shutdown = server.shutdown_token();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await.unwrap() });

    TestServer {
        addr,
        store,
        shutdown,
        _dir: dir,
    }
}

async fn read_reply<S>(stream: &mut BufReader<S>) -> String
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    line
}

async fn send_line<S>(stream: &mut BufReader<S>, line: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("{}\r\n", line).as_bytes())
        .await
        .unwrap();
    stream.flush().await.unwrap();
}

async fn roundtrip<S>(stream: &mut BufReader<S>, line: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_line(stream, line).await;
    read_reply(stream).await
}

/// Connects and consumes the greeting.
async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);
    let greeting = read_reply(&mut stream).await;
    assert!(greeting.starts_with("220"), "unexpected greeting: {}", greeting);
    stream
}

fn plain_payload(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password).as_bytes())
}

#[tokio::test]
async fn test_greeting_and_quit() {
    let server = start_server(30).await;
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = BufReader::new(stream);

    let greeting = read_reply(&mut stream).await;
    assert_eq!(greeting, "220 DefaultServerDisplayName service ready\r\n");

    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");
    assert_eq!(roundtrip(&mut stream, "QUIT").await, "221 Bye\r\n");

    // Channel closes after QUIT
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_command_before_ehlo_is_rejected() {
    let server = start_server(30).await;
    let mut stream = connect(server.addr).await;

    let reply = roundtrip(&mut stream, "MAIL FROM:<alice@localhost>").await;
    assert!(reply.starts_with("503"), "got: {}", reply);

    // NOOP and HELP work from any state
    assert!(roundtrip(&mut stream, "NOOP").await.starts_with("250"));
    assert!(roundtrip(&mut stream, "HELP").await.starts_with("214"));

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_register_auth_and_local_delivery() {
    let server = start_server(30).await;
    let mut stream = connect(server.addr).await;

    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    // Register two users over the wire
    let reply = roundtrip(
        &mut stream,
        &format!("REGISTER {}", plain_payload("alice", "s3cret")),
    )
    .await;
    assert_eq!(reply, "250 User registered successfully\r\n");

    let reply = roundtrip(
        &mut stream,
        &format!("REGISTER {}", plain_payload("bob", "hunter2")),
    )
    .await;
    assert_eq!(reply, "250 User registered successfully\r\n");

    // Registering again is refused
    let reply = roundtrip(
        &mut stream,
        &format!("REGISTER {}", plain_payload("alice", "other")),
    )
    .await;
    assert_eq!(reply, "550 User already exists\r\n");

    // AUTH PLAIN with the fresh credentials
    let reply = roundtrip(
        &mut stream,
        &format!("AUTH PLAIN {}", plain_payload("alice", "s3cret")),
    )
    .await;
    assert_eq!(reply, "235 Authentication successful\r\n");

    assert_eq!(
        roundtrip(&mut stream, "MAIL FROM:<alice@localhost>").await,
        "250 OK\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, "RCPT TO:<bob@localhost>").await,
        "250 OK\r\n"
    );

    let reply = roundtrip(&mut stream, "DATA").await;
    assert!(reply.starts_with("354"), "got: {}", reply);

    send_line(&mut stream, "Subject: hi").await;
    send_line(&mut stream, "").await;
    send_line(&mut stream, "hello").await;
    let reply = roundtrip(&mut stream, ".").await;
    assert_eq!(reply, "250 OK\r\n");

    assert_eq!(roundtrip(&mut stream, "QUIT").await, "221 Bye\r\n");

    let mails = server.store.retrieve_mail("bob", false).await.unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].sender, "alice");
    assert_eq!(mails[0].subject, "hi");
    assert!(mails[0].body.starts_with("hello"));

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_sender_rejected() {
    let server = start_server(30).await;
    let mut stream = connect(server.addr).await;

    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    let reply = roundtrip(&mut stream, "MAIL FROM:<ghost@localhost>").await;
    assert_eq!(reply, "550 Sender address does not exist\r\n");

    // Still in the post-EHLO state: RCPT is out of sequence
    let reply = roundtrip(&mut stream, "RCPT TO:<ghost@localhost>").await;
    assert!(reply.starts_with("503"), "got: {}", reply);

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_local_recipient_rejected() {
    let server = start_server(30).await;
    server.store.sign_up("alice", "pw").await.unwrap();

    let mut stream = connect(server.addr).await;
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");
    assert_eq!(
        roundtrip(&mut stream, "MAIL FROM:<alice@localhost>").await,
        "250 OK\r\n"
    );

    let reply = roundtrip(&mut stream, "RCPT TO:<ghost@localhost>").await;
    assert_eq!(reply, "550 Recipient address does not exist\r\n");

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_auth_failures() {
    let server = start_server(30).await;
    server.store.sign_up("alice", "s3cret").await.unwrap();

    let mut stream = connect(server.addr).await;
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    // Wrong password
    let reply = roundtrip(
        &mut stream,
        &format!("AUTH PLAIN {}", plain_payload("alice", "wrong")),
    )
    .await;
    assert_eq!(reply, "535 Authentication failed\r\n");

    // Unknown user
    let reply = roundtrip(
        &mut stream,
        &format!("AUTH PLAIN {}", plain_payload("ghost", "pw")),
    )
    .await;
    assert_eq!(reply, "535 Authentication failed\r\n");

    // Unsupported mechanism
    let reply = roundtrip(&mut stream, "AUTH LOGIN dXNlcg==").await;
    assert!(reply.starts_with("504"), "got: {}", reply);

    // Payload that is not base64
    let reply = roundtrip(&mut stream, "AUTH PLAIN %%%").await;
    assert!(reply.starts_with("501"), "got: {}", reply);

    // Valid base64 but missing NUL delimiters
    let payload = BASE64.encode(b"no-delimiters");
    let reply = roundtrip(&mut stream, &format!("AUTH PLAIN {}", payload)).await;
    assert!(reply.starts_with("501"), "got: {}", reply);

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_auth_payload_with_leading_whitespace() {
    let server = start_server(30).await;
    server.store.sign_up("alice", "s3cret").await.unwrap();

    let mut stream = connect(server.addr).await;
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    // Extra space between mechanism and payload
    let reply = roundtrip(
        &mut stream,
        &format!("AUTH PLAIN  {}", plain_payload("alice", "s3cret")),
    )
    .await;
    assert_eq!(reply, "235 Authentication successful\r\n");

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_rset_restores_post_ehlo_state() {
    let server = start_server(30).await;
    server.store.sign_up("alice", "pw").await.unwrap();
    server.store.sign_up("bob", "pw").await.unwrap();

    let mut stream = connect(server.addr).await;
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");
    assert_eq!(
        roundtrip(&mut stream, "MAIL FROM:<alice@localhost>").await,
        "250 OK\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, "RCPT TO:<bob@localhost>").await,
        "250 OK\r\n"
    );

    assert_eq!(roundtrip(&mut stream, "RSET").await, "250 OK\r\n");

    // DATA needs a fresh MAIL/RCPT exchange now
    let reply = roundtrip(&mut stream, "DATA").await;
    assert!(reply.starts_with("503"), "got: {}", reply);

    // And the envelope can be rebuilt as if freshly greeted
    assert_eq!(
        roundtrip(&mut stream, "MAIL FROM:<alice@localhost>").await,
        "250 OK\r\n"
    );

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_vrfy_and_expn() {
    let server = start_server(30).await;
    server.store.sign_up("alice", "pw").await.unwrap();

    let mut stream = connect(server.addr).await;
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    let reply = roundtrip(&mut stream, "VRFY alice").await;
    assert_eq!(reply, "250 User exists: alice@localhost\r\n");

    let reply = roundtrip(&mut stream, "VRFY ghost").await;
    assert_eq!(reply, "550 User does not exist\r\n");

    let reply = roundtrip(&mut stream, "EXPN alice").await;
    assert_eq!(reply, "250 Mailing list members: alice\r\n");

    let reply = roundtrip(&mut stream, "EXPN nobody").await;
    assert_eq!(reply, "550 Mailing list does not exist\r\n");

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_command() {
    let server = start_server(30).await;
    let mut stream = connect(server.addr).await;

    let reply = roundtrip(&mut stream, "BDAT 86").await;
    assert!(reply.starts_with("500"), "got: {}", reply);

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_data_body_is_not_dot_unstuffed() {
    let server = start_server(30).await;
    server.store.sign_up("alice", "pw").await.unwrap();
    server.store.sign_up("bob", "pw").await.unwrap();

    let mut stream = connect(server.addr).await;
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");
    assert_eq!(
        roundtrip(&mut stream, "MAIL FROM:<alice@localhost>").await,
        "250 OK\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, "RCPT TO:<bob@localhost>").await,
        "250 OK\r\n"
    );
    assert!(roundtrip(&mut stream, "DATA").await.starts_with("354"));

    send_line(&mut stream, "Subject: dots").await;
    send_line(&mut stream, "").await;
    send_line(&mut stream, "..leading dots stay").await;
    assert_eq!(roundtrip(&mut stream, ".").await, "250 OK\r\n");

    let mails = server.store.retrieve_mail("bob", true).await.unwrap();
    assert_eq!(mails.len(), 1);
    // The double dot is preserved verbatim
    assert!(mails[0].body.contains("..leading dots stay"));

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_starttls_upgrade_then_fresh_ehlo() {
    let server = start_server(30).await;
    server.store.sign_up("alice", "pw").await.unwrap();

    let mut stream = connect(server.addr).await;
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    // STARTTLS before EHLO would be 503; after EHLO the server is ready
    let reply = roundtrip(&mut stream, "STARTTLS").await;
    assert_eq!(reply, "220 Ready to start TLS\r\n");

    // Handshake on the same TCP socket
    let tcp = stream.into_inner();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls = relay_connector().connect(server_name, tcp).await.unwrap();
    let mut stream = BufReader::new(tls);

    // Fresh EHLO on the encrypted channel
    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    // A second STARTTLS is out of sequence
    let reply = roundtrip(&mut stream, "STARTTLS").await;
    assert!(reply.starts_with("503"), "got: {}", reply);

    // The encrypted channel carries the rest of the session normally
    assert_eq!(
        roundtrip(&mut stream, "MAIL FROM:<alice@localhost>").await,
        "250 OK\r\n"
    );
    assert_eq!(roundtrip(&mut stream, "QUIT").await, "221 Bye\r\n");

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_starttls_before_ehlo_is_rejected() {
    let server = start_server(30).await;
    let mut stream = connect(server.addr).await;

    let reply = roundtrip(&mut stream, "STARTTLS").await;
    assert!(reply.starts_with("503"), "got: {}", reply);

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_idle_timeout_closes_connection() {
    let server = start_server(1).await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = BufReader::new(stream);
    let _greeting = read_reply(&mut stream).await;

    // Send nothing; the server must hang up after the idle timeout
    let started = Instant::now();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    let elapsed = started.elapsed();

    assert!(read.is_ok(), "server did not close the connection");
    assert!(
        elapsed >= Duration::from_millis(900),
        "closed too early: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_secs(3),
        "closed too late: {:?}",
        elapsed
    );

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_server_shutdown_closes_sessions() {
    let server = start_server(30).await;
    let mut stream = connect(server.addr).await;

    assert_eq!(roundtrip(&mut stream, "EHLO client.example").await, "250 OK\r\n");

    server.shutdown.cancel();

    // The active session observes the cancellation and closes
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "session did not close on shutdown");

    // New connections are no longer accepted once the listener is gone
    tokio::time::sleep(Duration::from_millis(100)).await;
    let attempt = TcpStream::connect(server.addr).await;
    if let Ok(mut conn) = attempt {
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .ok()
            .and_then(|r| r.ok());
        assert_eq!(n, Some(0), "server still serving after shutdown");
    }

    server.shutdown.cancel();
}
