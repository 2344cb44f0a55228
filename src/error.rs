use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("idle timeout expired")]
    IdleTimeout,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("user does not exist: {0}")]
    NoSuchUser(String),

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("invalid username or password")]
    BadCredentials,

    #[error("password hashing failed: {0}")]
    HashFailure(String),

    #[error("no free database connection after waiting")]
    PoolTimeout,

    #[error("too many mails in queue")]
    QueueFull,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, MailError>;
