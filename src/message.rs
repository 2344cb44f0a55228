//! Mail message model and builder.
//!
//! A [`MailMessage`] is accumulated across MAIL FROM / RCPT TO / DATA and
//! consumed once at end-of-data, either by the store or by the relay.

use crate::error::{MailError, Result};

/// Maximum size of a single decoded attachment (5 MiB).
pub const MAX_ATTACHMENT_SIZE: usize = 5 * 1024 * 1024;

/// An address plus optional display name. The address alone is identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    address: String,
    display_name: String,
}

impl MailAddress {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The part after `@`, or empty when the address has no domain.
    pub fn domain(&self) -> &str {
        match self.address.find('@') {
            Some(pos) => &self.address[pos + 1..],
            None => "",
        }
    }

    /// The part before `@`, or the whole address when there is no `@`.
    pub fn local_part(&self) -> &str {
        match self.address.find('@') {
            Some(pos) => &self.address[..pos],
            None => &self.address,
        }
    }
}

impl std::fmt::Display for MailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    pub filename: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl Default for MailAddress {
    fn default() -> Self {
        Self {
            address: String::new(),
            display_name: String::new(),
        }
    }
}

/// Accumulates a message during a session. Reset after RSET and after every
/// completed DATA, successful or not.
#[derive(Debug, Default)]
pub struct MailMessageBuilder {
    message: MailMessage,
}

impl MailMessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_from(&mut self, address: impl Into<String>) -> &mut Self {
        self.message.from = MailAddress::new(address, "");
        self
    }

    pub fn add_to(&mut self, address: impl Into<String>) -> &mut Self {
        self.message.to.push(MailAddress::new(address, ""));
        self
    }

    pub fn add_cc(&mut self, address: impl Into<String>) -> &mut Self {
        self.message.cc.push(MailAddress::new(address, ""));
        self
    }

    pub fn add_bcc(&mut self, address: impl Into<String>) -> &mut Self {
        self.message.bcc.push(MailAddress::new(address, ""));
        self
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) -> &mut Self {
        self.message.subject = subject.into();
        self
    }

    /// Appends one line of body text, restoring the CRLF the framing layer
    /// stripped.
    pub fn append_body_line(&mut self, line: &str) -> &mut Self {
        self.message.body.push_str(line);
        self.message.body.push_str("\r\n");
        self
    }

    pub fn set_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.message.body = body.into();
        self
    }

    pub fn body(&self) -> &str {
        &self.message.body
    }

    pub fn add_attachment(&mut self, attachment: Attachment) -> Result<&mut Self> {
        if attachment.payload.len() > MAX_ATTACHMENT_SIZE {
            return Err(MailError::SmtpProtocol(format!(
                "attachment {} exceeds {} bytes",
                attachment.filename, MAX_ATTACHMENT_SIZE
            )));
        }
        self.message.attachments.push(attachment);
        Ok(self)
    }

    pub fn has_sender(&self) -> bool {
        !self.message.from.address().is_empty()
    }

    pub fn recipients(&self) -> &[MailAddress] {
        &self.message.to
    }

    /// Consumes the accumulated state. Fails unless a sender and at least one
    /// recipient were set.
    pub fn build(&mut self) -> Result<MailMessage> {
        if self.message.from.address().is_empty() || self.message.to.is_empty() {
            return Err(MailError::SmtpProtocol(
                "Not all required fields are filled".to_string(),
            ));
        }
        Ok(std::mem::take(&mut self.message))
    }

    pub fn reset(&mut self) {
        self.message = MailMessage::default();
    }
}
