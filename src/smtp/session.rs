//! The per-connection SMTP state machine.
//!
//! One session owns one [`Channel`] and drives it to completion: greeting,
//! command loop, optional STARTTLS upgrade, DATA accumulation, and routing
//! of the finished message to the store (local recipients) or the relay
//! (remote recipients).
//!
//! Handler failures become reply lines and the session continues; transport
//! errors, the idle timeout, and QUIT end it.

use crate::error::MailError;
use crate::message::{MailAddress, MailMessage, MailMessageBuilder};
use crate::mime;
use crate::relay::{ForwardOutcome, MailForwarder};
use crate::security::auth;
use crate::security::TlsConfig;
use crate::smtp::commands::SmtpCommand;
use crate::smtp::responses::{self, Reply};
use crate::smtp::stream::Channel;
use crate::store::MailStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bytes per read from the channel.
const READ_CHUNK: usize = 1024;

/// Errors tolerated before the session is disconnected with 421.
const MAX_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    EhloReceived,
    Authenticated,
    MailFromReceived,
    RcptToReceived,
    ReceivingData,
    Closing,
}

pub struct SmtpSession {
    state: SessionState,
    builder: MailMessageBuilder,
    authed_user: Option<String>,
    data_buf: String,
    client_name: Option<String>,
    error_count: usize,
    host_name: String,
    display_name: String,
    store: Arc<MailStore>,
    forwarder: Arc<MailForwarder>,
    tls_config: Arc<TlsConfig>,
}

impl SmtpSession {
    pub fn new(
        store: Arc<MailStore>,
        forwarder: Arc<MailForwarder>,
        tls_config: Arc<TlsConfig>,
        host_name: String,
        display_name: String,
    ) -> Self {
        Self {
            state: SessionState::Connected,
            builder: MailMessageBuilder::new(),
            authed_user: None,
            data_buf: String::new(),
            client_name: None,
            error_count: 0,
            host_name,
            display_name,
            store,
            forwarder,
            tls_config,
        }
    }

    /// Runs the session to completion.
    pub async fn handle(
        mut self,
        stream: TcpStream,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> crate::error::Result<()> {
        let mut channel = Channel::new(stream, idle_timeout);

        channel
            .write_all(responses::greeting(&self.display_name).as_bytes())
            .await?;

        let mut pending = String::new();
        let mut chunk = [0u8; READ_CHUNK];

        'session: while self.state != SessionState::Closing {
            let n = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Server shutting down, closing session");
                    break 'session;
                }
                read = channel.read(&mut chunk) => match read {
                    Ok(0) => {
                        debug!("Client disconnected");
                        break 'session;
                    }
                    Ok(n) => n,
                    Err(MailError::IdleTimeout) => {
                        warn!("Idle timeout, closing session");
                        break 'session;
                    }
                    Err(e) => {
                        warn!("Read error: {}", e);
                        break 'session;
                    }
                }
            };

            pending.push_str(&String::from_utf8_lossy(&chunk[..n]));

            while let Some(pos) = pending.find("\r\n") {
                let line = pending[..pos].to_string();
                pending.replace_range(..pos + 2, "");

                if self.state == SessionState::ReceivingData {
                    self.handle_data_line(&mut channel, &line).await?;
                } else {
                    self.process_line(&mut channel, &line).await?;
                }

                if self.state == SessionState::Closing {
                    break 'session;
                }

                if self.error_count >= MAX_ERRORS {
                    warn!("Too many errors, disconnecting");
                    channel
                        .write_all(Reply::ServerUnavailable.as_str().as_bytes())
                        .await?;
                    break 'session;
                }
            }
        }

        channel.close().await;
        Ok(())
    }

    /// Parses one command line and writes exactly one reply.
    async fn process_line(
        &mut self,
        channel: &mut Channel,
        line: &str,
    ) -> crate::error::Result<()> {
        debug!("Received: {}", line);

        let cmd = match SmtpCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("Command parse error: {}", e);
                self.error_count += 1;
                return channel
                    .write_all(Reply::SyntaxErrorInParameters.as_str().as_bytes())
                    .await;
            }
        };

        // STARTTLS swaps the transport, so it handles the channel itself
        if cmd == SmtpCommand::StartTls {
            return self.handle_starttls(channel).await;
        }

        let reply = self.handle_command(cmd).await;
        channel.write_all(reply.as_bytes()).await
    }

    async fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (self.state, cmd) {
            (SessionState::Connected | SessionState::EhloReceived, SmtpCommand::Ehlo(name)) => {
                info!("EHLO from {}", name);
                self.client_name = Some(name);
                self.state = SessionState::EhloReceived;
                Reply::Ok.as_str().to_string()
            }
            (SessionState::EhloReceived, SmtpCommand::Auth(mechanism, payload)) => {
                self.handle_auth(&mechanism, payload).await
            }
            (SessionState::EhloReceived, SmtpCommand::Register(payload)) => {
                self.handle_register(&payload).await
            }
            (
                SessionState::EhloReceived | SessionState::Authenticated,
                SmtpCommand::MailFrom(address),
            ) => self.handle_mail_from(&address).await,
            (
                SessionState::MailFromReceived | SessionState::RcptToReceived,
                SmtpCommand::RcptTo(address),
            ) => self.handle_rcpt_to(&address).await,
            (SessionState::RcptToReceived, SmtpCommand::Data) => {
                self.data_buf.clear();
                self.state = SessionState::ReceivingData;
                Reply::StartMailInput.as_str().to_string()
            }
            (_, SmtpCommand::Rset) => {
                self.builder.reset();
                self.data_buf.clear();
                self.state = SessionState::EhloReceived;
                Reply::Ok.as_str().to_string()
            }
            (_, SmtpCommand::Noop) => Reply::Ok.as_str().to_string(),
            (_, SmtpCommand::Help) => Reply::HelpMessage.as_str().to_string(),
            (_, SmtpCommand::Vrfy(name)) => self.handle_vrfy(&name).await,
            (_, SmtpCommand::Expn(list)) => self.handle_expn(&list).await,
            (_, SmtpCommand::Quit) => {
                info!("QUIT, closing session");
                self.state = SessionState::Closing;
                Reply::ClosingChannel.as_str().to_string()
            }
            (_, SmtpCommand::Unknown(verb)) => {
                debug!("Unknown command: {}", verb);
                self.error_count += 1;
                Reply::SyntaxError.as_str().to_string()
            }
            _ => {
                self.error_count += 1;
                Reply::BadSequence.as_str().to_string()
            }
        }
    }

    async fn handle_auth(&mut self, mechanism: &str, payload: Option<String>) -> String {
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return Reply::ParameterNotImplemented.as_str().to_string();
        }

        let Some(payload) = payload else {
            self.error_count += 1;
            return Reply::SyntaxErrorInParameters.as_str().to_string();
        };

        let (username, password) = match auth::decode_plain_credentials(&payload) {
            Ok(credentials) => credentials,
            Err(e) => {
                debug!("Bad AUTH PLAIN payload: {}", e);
                self.error_count += 1;
                return Reply::SyntaxErrorInParameters.as_str().to_string();
            }
        };

        match self.store.login(&username, &password).await {
            Ok(()) => {
                info!("Authentication successful for {}", username);
                self.authed_user = Some(username);
                self.state = SessionState::Authenticated;
                Reply::AuthSuccessful.as_str().to_string()
            }
            Err(MailError::NoSuchUser(_)) | Err(MailError::BadCredentials) => {
                warn!("Authentication failed for {}", username);
                self.error_count += 1;
                Reply::AuthFailed.as_str().to_string()
            }
            Err(e) => {
                error!("AUTH error: {}", e);
                Reply::LocalError.as_str().to_string()
            }
        }
    }

    async fn handle_register(&mut self, payload: &str) -> String {
        let (username, password) = match auth::decode_plain_credentials(payload) {
            Ok(credentials) => credentials,
            Err(e) => {
                debug!("Bad REGISTER payload: {}", e);
                self.error_count += 1;
                return Reply::SyntaxErrorInParameters.as_str().to_string();
            }
        };

        match self.store.sign_up(&username, &password).await {
            Ok(()) => {
                info!("Registered user {}", username);
                Reply::RegisterSuccessful.as_str().to_string()
            }
            Err(MailError::UserExists(_)) => Reply::UserAlreadyExists.as_str().to_string(),
            Err(e) => {
                error!("REGISTER error: {}", e);
                Reply::LocalError.as_str().to_string()
            }
        }
    }

    async fn handle_mail_from(&mut self, address: &str) -> String {
        let sender = MailAddress::new(address, "");

        // Senders are local users of this host
        if !sender.domain().is_empty() && sender.domain() != self.host_name {
            return Reply::SenderUnknown.as_str().to_string();
        }

        match self.store.user_exists(sender.local_part()).await {
            Ok(true) => {
                info!("MAIL FROM: {}", address);
                self.builder.set_from(address);
                self.state = SessionState::MailFromReceived;
                Reply::Ok.as_str().to_string()
            }
            Ok(false) => {
                debug!("Unknown sender: {}", address);
                Reply::SenderUnknown.as_str().to_string()
            }
            Err(e) => {
                error!("MAIL FROM lookup error: {}", e);
                Reply::LocalError.as_str().to_string()
            }
        }
    }

    async fn handle_rcpt_to(&mut self, address: &str) -> String {
        let recipient = MailAddress::new(address, "");

        if !recipient.domain().is_empty() && recipient.domain() != self.host_name {
            // Remote recipient: accepted now, relayed at end-of-data
            info!("RCPT TO (remote): {}", address);
            self.builder.add_to(address);
            self.state = SessionState::RcptToReceived;
            return Reply::UserNotLocal.as_str().to_string();
        }

        match self.store.user_exists(recipient.local_part()).await {
            Ok(true) => {
                info!("RCPT TO: {}", address);
                self.builder.add_to(address);
                self.state = SessionState::RcptToReceived;
                Reply::Ok.as_str().to_string()
            }
            Ok(false) => {
                debug!("Unknown recipient: {}", address);
                Reply::RecipientUnknown.as_str().to_string()
            }
            Err(e) => {
                error!("RCPT TO lookup error: {}", e);
                Reply::LocalError.as_str().to_string()
            }
        }
    }

    async fn handle_vrfy(&self, name: &str) -> String {
        match self.store.retrieve_user_info(name).await {
            Ok(users) => match users.first() {
                Some(user) => responses::user_exists(&user.username, &user.host),
                None => Reply::UserUnknown.as_str().to_string(),
            },
            Err(e) => {
                error!("VRFY error: {}", e);
                Reply::LocalError.as_str().to_string()
            }
        }
    }

    async fn handle_expn(&self, list: &str) -> String {
        match self.store.retrieve_user_info(list).await {
            Ok(users) if !users.is_empty() => {
                let members: Vec<String> =
                    users.into_iter().map(|user| user.username).collect();
                responses::mailing_list_members(&members)
            }
            Ok(_) => Reply::MailingListUnknown.as_str().to_string(),
            Err(e) => {
                error!("EXPN error: {}", e);
                Reply::LocalError.as_str().to_string()
            }
        }
    }

    /// STARTTLS: reply 220, swap the transport, reset the protocol state.
    async fn handle_starttls(&mut self, channel: &mut Channel) -> crate::error::Result<()> {
        if channel.is_tls() || self.state != SessionState::EhloReceived {
            self.error_count += 1;
            return channel
                .write_all(Reply::BadSequence.as_str().as_bytes())
                .await;
        }

        channel
            .write_all(Reply::ReadyToStartTls.as_str().as_bytes())
            .await?;

        match channel.upgrade_tls(&self.tls_config.acceptor()).await {
            Ok(()) => {
                info!("STARTTLS upgrade completed");
                // Fresh EHLO expected on the encrypted channel
                self.builder.reset();
                self.authed_user = None;
                self.state = SessionState::EhloReceived;
                Ok(())
            }
            Err(e) => {
                // The handshake consumed the plain socket; nothing more can
                // be written, so the session ends here.
                error!("STARTTLS failed: {}", e);
                self.state = SessionState::Closing;
                Ok(())
            }
        }
    }

    /// One line of DATA. A lone dot ends the body; everything else is
    /// appended verbatim (no dot-unstuffing).
    async fn handle_data_line(
        &mut self,
        channel: &mut Channel,
        line: &str,
    ) -> crate::error::Result<()> {
        if line == "." {
            debug!(
                "End of DATA, {} bytes (client {:?}, user {:?})",
                self.data_buf.len(),
                self.client_name,
                self.authed_user
            );
            self.state = SessionState::EhloReceived;
            let reply = self.finalize_message().await;
            return channel.write_all(reply.as_bytes()).await;
        }

        self.data_buf.push_str(line);
        self.data_buf.push_str("\r\n");
        Ok(())
    }

    /// Builds the accumulated message and routes it: local recipients to the
    /// store, remote recipients to the relay. The builder is spent either
    /// way.
    async fn finalize_message(&mut self) -> String {
        let payload = std::mem::take(&mut self.data_buf);

        let parsed = match mime::parse(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable message payload: {}", e);
                self.builder.reset();
                return Reply::RequiredFieldsMissing.as_str().to_string();
            }
        };

        self.builder.set_subject(parsed.subject);
        self.builder.set_body(parsed.body);
        for attachment in parsed.attachments {
            if let Err(e) = self.builder.add_attachment(attachment) {
                warn!("Attachment rejected: {}", e);
                self.builder.reset();
                return Reply::MailboxFull.as_str().to_string();
            }
        }

        let message = match self.builder.build() {
            Ok(message) => message,
            Err(e) => {
                warn!("Message incomplete at end of DATA: {}", e);
                self.builder.reset();
                return Reply::RequiredFieldsMissing.as_str().to_string();
            }
        };

        let (local, remote): (Vec<MailAddress>, Vec<MailAddress>) = message
            .to
            .iter()
            .cloned()
            .partition(|addr| addr.domain().is_empty() || addr.domain() == self.host_name);

        if !local.is_empty() {
            let recipients: Vec<String> = local
                .iter()
                .map(|addr| addr.local_part().to_string())
                .collect();

            let stored = self
                .store
                .insert_mail(
                    message.from.local_part(),
                    &recipients,
                    &message.subject,
                    &message.body,
                    &message.attachments,
                )
                .await;

            match stored {
                Ok(()) => {
                    info!(
                        "Stored mail from {} for {} local recipient(s)",
                        message.from,
                        recipients.len()
                    );
                }
                Err(MailError::QueueFull) => {
                    warn!("Write-behind queue full, rejecting mail");
                    return Reply::InsufficientStorage.as_str().to_string();
                }
                Err(MailError::NoSuchUser(user)) => {
                    warn!("Recipient vanished before insert: {}", user);
                    return Reply::RecipientUnknown.as_str().to_string();
                }
                Err(e) => {
                    error!("Failed to store mail: {}", e);
                    return Reply::LocalError.as_str().to_string();
                }
            }
        }

        if !remote.is_empty() {
            let relayed = MailMessage {
                to: remote,
                ..message
            };

            match self.forwarder.forward(&relayed).await {
                ForwardOutcome::Delivered => {
                    info!(
                        "Relayed mail from {} to {} remote recipient(s)",
                        relayed.from,
                        relayed.to.len()
                    );
                }
                ForwardOutcome::Partial { failed } => {
                    warn!("Relay delivered partially; failed: {:?}", failed);
                    return Reply::LocalError.as_str().to_string();
                }
                ForwardOutcome::AllFailed => {
                    warn!("Relay failed for every remote recipient");
                    return Reply::UnableToRelay.as_str().to_string();
                }
            }
        }

        Reply::Ok.as_str().to_string()
    }
}
