//! SMTP reply lines.
//!
//! Fixed reply lines live in [`Reply`]; replies that carry per-session text
//! (the banner, VRFY/EXPN results) are formatted by the helpers below.

/// Fixed SMTP replies, each a complete CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    HelpMessage,
    ReadyToStartTls,
    ClosingChannel,
    AuthSuccessful,
    RegisterSuccessful,
    Ok,
    UserNotLocal,
    CannotVerifyUser,
    AuthMechanismAccepted,
    StartMailInput,
    ServerUnavailable,
    MailboxUnavailable,
    LocalError,
    InsufficientStorage,
    TlsUnavailable,
    SyntaxError,
    SyntaxErrorInParameters,
    CommandNotImplemented,
    BadSequence,
    ParameterNotImplemented,
    AuthRequired,
    AuthFailed,
    EncryptionRequired,
    SenderUnknown,
    RecipientUnknown,
    UserAlreadyExists,
    UserUnknown,
    MailingListUnknown,
    RequiredFieldsMissing,
    UnableToRelay,
    MailboxFull,
    TransactionFailed,
}

impl Reply {
    pub fn as_str(self) -> &'static str {
        match self {
            Reply::HelpMessage => {
                "214 The following commands are recognized: EHLO, STARTTLS, AUTH PLAIN, \
                 REGISTER, MAIL FROM, RCPT TO, DATA, NOOP, RSET, HELP, VRFY, EXPN, QUIT\r\n"
            }
            Reply::ReadyToStartTls => "220 Ready to start TLS\r\n",
            Reply::ClosingChannel => "221 Bye\r\n",
            Reply::AuthSuccessful => "235 Authentication successful\r\n",
            Reply::RegisterSuccessful => "250 User registered successfully\r\n",
            Reply::Ok => "250 OK\r\n",
            Reply::UserNotLocal => "251 User not local, will forward\r\n",
            Reply::CannotVerifyUser => "252 Cannot verify user\r\n",
            Reply::AuthMechanismAccepted => "334 Authentication mechanism accepted\r\n",
            Reply::StartMailInput => "354 End data with <CR><LF>.<CR><LF>\r\n",
            Reply::ServerUnavailable => "421 Server unavailable\r\n",
            Reply::MailboxUnavailable => "450 Mailbox unavailable\r\n",
            Reply::LocalError => "451 Local error in processing\r\n",
            Reply::InsufficientStorage => "452 Insufficient system storage\r\n",
            Reply::TlsUnavailable => "454 TLS temporarily unavailable\r\n",
            Reply::SyntaxError => "500 Syntax error, command unrecognized\r\n",
            Reply::SyntaxErrorInParameters => "501 Syntax error in parameters or arguments\r\n",
            Reply::CommandNotImplemented => "502 Command not implemented\r\n",
            Reply::BadSequence => "503 Bad sequence of commands\r\n",
            Reply::ParameterNotImplemented => "504 Command parameter not implemented\r\n",
            Reply::AuthRequired => "530 Authentication required\r\n",
            Reply::AuthFailed => "535 Authentication failed\r\n",
            Reply::EncryptionRequired => "538 Encryption required\r\n",
            Reply::SenderUnknown => "550 Sender address does not exist\r\n",
            Reply::RecipientUnknown => "550 Recipient address does not exist\r\n",
            Reply::UserAlreadyExists => "550 User already exists\r\n",
            Reply::UserUnknown => "550 User does not exist\r\n",
            Reply::MailingListUnknown => "550 Mailing list does not exist\r\n",
            Reply::RequiredFieldsMissing => "550 Required fields missing\r\n",
            Reply::UnableToRelay => "550 Unable to relay message\r\n",
            Reply::MailboxFull => "552 Mailbox full\r\n",
            Reply::TransactionFailed => "554 Transaction failed\r\n",
        }
    }

    /// The three-digit code of the reply.
    pub fn code(self) -> u16 {
        // Replies always start with the code
        self.as_str()[..3].parse().unwrap_or(0)
    }
}

/// The 220 banner sent on accept.
pub fn greeting(display_name: &str) -> String {
    format!("220 {} service ready\r\n", display_name)
}

/// VRFY success line.
pub fn user_exists(username: &str, host: &str) -> String {
    format!("250 User exists: {}@{}\r\n", username, host)
}

/// EXPN success line, members comma-separated.
pub fn mailing_list_members(members: &[String]) -> String {
    format!("250 Mailing list members: {}\r\n", members.join(", "))
}
