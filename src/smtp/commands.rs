//! SMTP command parsing.
//!
//! Verbs are matched case-insensitively. `REGISTER` is a non-standard
//! extension carrying a SASL-PLAIN-shaped payload for user sign-up.

use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    StartTls,
    /// AUTH with mechanism and optional initial response.
    Auth(String, Option<String>),
    /// REGISTER with the base64 credentials payload.
    Register(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Noop,
    Rset,
    Help,
    Vrfy(String),
    Expn(String),
    Quit,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("Empty command".to_string()));
        }

        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or("").to_uppercase();
        let args = parts.next().map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "EHLO" | "HELO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "STARTTLS" => Ok(SmtpCommand::StartTls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("AUTH requires mechanism".to_string()));
                }
                let mut auth_parts = args.splitn(2, ' ');
                let mechanism = auth_parts.next().unwrap_or("").to_string();
                let initial_response = auth_parts.next().map(|s| s.to_string());
                Ok(SmtpCommand::Auth(mechanism, initial_response))
            }
            "REGISTER" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol(
                        "REGISTER requires credentials".to_string(),
                    ));
                }
                Ok(SmtpCommand::Register(args.to_string()))
            }
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => Ok(SmtpCommand::RcptTo(Self::parse_path(args, "TO:")?)),
            "DATA" => Ok(SmtpCommand::Data),
            "NOOP" => Ok(SmtpCommand::Noop),
            "RSET" => Ok(SmtpCommand::Rset),
            "HELP" => Ok(SmtpCommand::Help),
            "VRFY" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("VRFY requires a name".to_string()));
                }
                Ok(SmtpCommand::Vrfy(args.to_string()))
            }
            "EXPN" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EXPN requires a list".to_string()));
                }
                Ok(SmtpCommand::Expn(args.to_string()))
            }
            "QUIT" => Ok(SmtpCommand::Quit),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parses `FROM:<addr>` / `TO:<addr>` argument forms, angle brackets
    /// optional.
    fn parse_path(args: &str, prefix: &str) -> Result<String> {
        if !args.to_uppercase().starts_with(prefix) {
            return Err(MailError::SmtpProtocol(format!(
                "Expected {}<address>",
                prefix
            )));
        }

        let address = args[prefix.len()..].trim();
        let address = if address.starts_with('<') && address.ends_with('>') && address.len() >= 2 {
            &address[1..address.len() - 1]
        } else {
            address
        };

        if address.is_empty() {
            return Err(MailError::SmtpProtocol("Empty address".to_string()));
        }

        Ok(address.to_string())
    }
}
