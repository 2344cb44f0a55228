//! Mail storage.
//!
//! [`MailStore`] is the capability sessions use for user lookup, credential
//! verification, and mail persistence. It runs over a bounded pool of SQLite
//! connections ([`pool`]) and can optionally route inserts through a
//! write-behind batch writer ([`writer`]).
//!
//! Usernames are local parts; every operation is scoped to the host the
//! store was opened with. Body and attachment content are deduplicated by
//! exact content; mail rows never are.

pub mod pool;
pub mod writer;

pub use pool::{ConnectionPool, PooledConnection};
pub use writer::{MailWriter, QueuedMail};

use crate::error::{MailError, Result};
use crate::message::Attachment;
use crate::security::auth;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, info};

/// A stored user, as returned by VRFY/EXPN-style queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub host: String,
}

/// One delivered mail row, newest first in retrieval order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMail {
    pub recipient: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub is_received: bool,
}

pub struct MailStore {
    pool: ConnectionPool,
    host_id: i64,
    host_name: String,
    writer: Option<MailWriter>,
}

impl MailStore {
    /// Opens the store, creating the schema and the host row if needed.
    pub async fn connect(url: &str, host_name: &str, pool_size: usize) -> Result<Self> {
        let pool = ConnectionPool::connect(url, pool_size).await?;

        let host_id = {
            let mut conn = pool.acquire().await?;
            create_schema(&mut conn).await?;

            sqlx::query("INSERT OR IGNORE INTO hosts (host_name) VALUES (?)")
                .bind(host_name)
                .execute(&mut *conn)
                .await?;

            sqlx::query_scalar::<_, i64>("SELECT host_id FROM hosts WHERE host_name = ?")
                .bind(host_name)
                .fetch_one(&mut *conn)
                .await?
        };

        info!("Mail store ready for host {} (id {})", host_name, host_id);

        Ok(Self {
            pool,
            host_id,
            host_name: host_name.to_string(),
            writer: None,
        })
    }

    /// Switches `insert_mail` to the write-behind path. The writer gets its
    /// own dedicated connection so batch flushes never compete for leases.
    pub async fn enable_write_behind(
        &mut self,
        url: &str,
        queue_size: usize,
        flush_interval: std::time::Duration,
    ) -> Result<()> {
        let conn = SqliteConnection::connect(url).await?;
        self.writer = Some(MailWriter::spawn(
            conn,
            self.host_id,
            queue_size,
            flush_interval,
        ));
        Ok(())
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Registers a new user under this host.
    pub async fn sign_up(&self, username: &str, password: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM users WHERE host_id = ? AND user_name = ?",
        )
        .bind(self.host_id)
        .bind(username)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();

        if exists {
            return Err(MailError::UserExists(username.to_string()));
        }

        let hashed_password = auth::hash_password(password)?;

        sqlx::query("INSERT INTO users (host_id, user_name, password_hash) VALUES (?, ?, ?)")
            .bind(self.host_id)
            .bind(username)
            .bind(&hashed_password)
            .execute(&mut *conn)
            .await?;

        info!("User {} registered on {}", username, self.host_name);
        Ok(())
    }

    /// Verifies credentials. The caller owns the authenticated identity.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        let stored_hash = sqlx::query_scalar::<_, String>(
            "SELECT password_hash FROM users WHERE host_id = ? AND user_name = ?",
        )
        .bind(self.host_id)
        .bind(username)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| MailError::NoSuchUser(username.to_string()))?;

        if !auth::verify_password(password, &stored_hash)? {
            return Err(MailError::BadCredentials);
        }

        debug!("Login verified for {}", username);
        Ok(())
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;

        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM users WHERE host_id = ? AND user_name = ?",
        )
        .bind(self.host_id)
        .bind(username)
        .fetch_optional(&mut *conn)
        .await?
        .is_some())
    }

    /// Users matching `username`, or every user when it is empty.
    pub async fn retrieve_user_info(&self, username: &str) -> Result<Vec<User>> {
        let mut conn = self.pool.acquire().await?;

        let query = if username.is_empty() {
            sqlx::query_as::<_, (String, String, String)>(
                "SELECT u.user_name, u.password_hash, h.host_name FROM users u \
                 LEFT JOIN hosts h ON u.host_id = h.host_id",
            )
        } else {
            sqlx::query_as::<_, (String, String, String)>(
                "SELECT u.user_name, u.password_hash, h.host_name FROM users u \
                 LEFT JOIN hosts h ON u.host_id = h.host_id \
                 WHERE u.user_name = ?",
            )
            .bind(username)
        };

        let rows = query.fetch_all(&mut *conn).await?;

        Ok(rows
            .into_iter()
            .map(|(username, password_hash, host)| User {
                username,
                password_hash,
                host,
            })
            .collect())
    }

    /// Persists one message for each recipient. With the write-behind writer
    /// enabled this only enqueues and returns; a full queue fails fast.
    pub async fn insert_mail(
        &self,
        sender: &str,
        recipients: &[String],
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        if let Some(writer) = &self.writer {
            return writer.enqueue(QueuedMail {
                sender: sender.to_string(),
                recipients: recipients.to_vec(),
                subject: subject.to_string(),
                body: body.to_string(),
                attachments: attachments.iter().map(encode_attachment).collect(),
            });
        }

        let mut conn = self.pool.acquire().await?;
        let encoded: Vec<String> = attachments.iter().map(encode_attachment).collect();
        insert_mail_on(
            &mut conn,
            self.host_id,
            sender,
            recipients,
            subject,
            body,
            &encoded,
        )
        .await
    }

    /// Mails for `username`, newest first. Unreceived only unless
    /// `include_all`.
    pub async fn retrieve_mail(
        &self,
        username: &str,
        include_all: bool,
    ) -> Result<Vec<StoredMail>> {
        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_user_id(&mut conn, self.host_id, username).await?;

        let filter = if include_all {
            ""
        } else {
            "AND m.is_received = FALSE "
        };
        let query = format!(
            "SELECT u.user_name, m.subject, b.body_content, m.is_received \
             FROM email_messages m \
             LEFT JOIN users u ON u.user_id = m.sender_id \
             LEFT JOIN mail_bodies b ON b.body_id = m.body_id \
             WHERE m.recipient_id = ? {}\
             ORDER BY m.sent_at DESC, m.id DESC",
            filter
        );

        let rows = sqlx::query_as::<_, (String, String, String, bool)>(&query)
            .bind(user_id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(sender, subject, body, is_received)| StoredMail {
                recipient: username.to_string(),
                sender,
                subject,
                body,
                is_received,
            })
            .collect())
    }

    /// Flips every unreceived mail of `username` to received.
    pub async fn mark_received(&self, username: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_user_id(&mut conn, self.host_id, username).await?;

        sqlx::query(
            "UPDATE email_messages SET is_received = TRUE \
             WHERE recipient_id = ? AND is_received = FALSE",
        )
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Deletes every mail where `username` is sender or recipient.
    pub async fn delete_mail(&self, username: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_user_id(&mut conn, self.host_id, username).await?;

        sqlx::query("DELETE FROM email_messages WHERE sender_id = ? OR recipient_id = ?")
            .bind(user_id)
            .bind(user_id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Authenticates, then removes the user's mail and the user itself.
    pub async fn delete_user(&self, username: &str, password: &str) -> Result<()> {
        self.login(username, password).await?;
        self.delete_mail(username).await?;

        let mut conn = self.pool.acquire().await?;
        sqlx::query("DELETE FROM users WHERE host_id = ? AND user_name = ?")
            .bind(self.host_id)
            .bind(username)
            .execute(&mut *conn)
            .await?;

        info!("User {} deleted from {}", username, self.host_name);
        Ok(())
    }

    pub async fn create_folder(&self, username: &str, folder: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_user_id(&mut conn, self.host_id, username).await?;

        sqlx::query("INSERT OR IGNORE INTO folders (user_id, folder_name) VALUES (?, ?)")
            .bind(user_id)
            .bind(folder)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    pub async fn delete_folder(&self, username: &str, folder: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_user_id(&mut conn, self.host_id, username).await?;
        let folder_id = resolve_folder_id(&mut conn, user_id, folder).await?;

        let mut tx = conn.begin().await?;
        sqlx::query("DELETE FROM folder_messages WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM folders WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Files a message into one of the user's folders.
    pub async fn move_to_folder(
        &self,
        username: &str,
        message_id: i64,
        folder: &str,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_user_id(&mut conn, self.host_id, username).await?;
        let folder_id = resolve_folder_id(&mut conn, user_id, folder).await?;

        let mut tx = conn.begin().await?;
        sqlx::query("DELETE FROM folder_messages WHERE message_id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO folder_messages (folder_id, message_id) VALUES (?, ?)")
            .bind(folder_id)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn add_flag(&self, message_id: i64, flag: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        let mut tx = conn.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO flags (flag_name) VALUES (?)")
            .bind(flag)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO message_flags (message_id, flag_id) \
             SELECT ?, flag_id FROM flags WHERE flag_name = ?",
        )
        .bind(message_id)
        .bind(flag)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn remove_flag(&self, message_id: i64, flag: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            "DELETE FROM message_flags WHERE message_id = ? \
             AND flag_id IN (SELECT flag_id FROM flags WHERE flag_name = ?)",
        )
        .bind(message_id)
        .bind(flag)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Stops the write-behind writer, draining anything still queued.
    pub async fn shutdown(&self) {
        if let Some(writer) = &self.writer {
            writer.shutdown().await;
        }
    }
}

/// Attachment wire form for the deduplicated content table:
/// base64 of `content_type|filename|payload`.
fn encode_attachment(attachment: &Attachment) -> String {
    let mut raw =
        Vec::with_capacity(attachment.content_type.len() + attachment.filename.len() + 2 + attachment.payload.len());
    raw.extend_from_slice(attachment.content_type.as_bytes());
    raw.push(b'|');
    raw.extend_from_slice(attachment.filename.as_bytes());
    raw.push(b'|');
    raw.extend_from_slice(&attachment.payload);
    BASE64.encode(raw)
}

async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    const SCHEMA: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS hosts (
            host_id INTEGER PRIMARY KEY AUTOINCREMENT,
            host_name TEXT NOT NULL UNIQUE
        )",
        "CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY AUTOINCREMENT,
            host_id INTEGER NOT NULL REFERENCES hosts(host_id),
            user_name TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            UNIQUE(host_id, user_name)
        )",
        "CREATE TABLE IF NOT EXISTS mail_bodies (
            body_id INTEGER PRIMARY KEY AUTOINCREMENT,
            body_content TEXT NOT NULL UNIQUE
        )",
        "CREATE TABLE IF NOT EXISTS mail_attachments (
            attachment_id INTEGER PRIMARY KEY AUTOINCREMENT,
            attachment_data TEXT NOT NULL UNIQUE
        )",
        "CREATE TABLE IF NOT EXISTS email_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL REFERENCES users(user_id),
            recipient_id INTEGER NOT NULL REFERENCES users(user_id),
            subject TEXT NOT NULL,
            body_id INTEGER NOT NULL REFERENCES mail_bodies(body_id),
            attachment_id INTEGER REFERENCES mail_attachments(attachment_id),
            is_received BOOLEAN NOT NULL DEFAULT FALSE,
            sent_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS folders (
            folder_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(user_id),
            folder_name TEXT NOT NULL,
            UNIQUE(user_id, folder_name)
        )",
        "CREATE TABLE IF NOT EXISTS folder_messages (
            folder_id INTEGER NOT NULL REFERENCES folders(folder_id),
            message_id INTEGER NOT NULL REFERENCES email_messages(id)
        )",
        "CREATE TABLE IF NOT EXISTS flags (
            flag_id INTEGER PRIMARY KEY AUTOINCREMENT,
            flag_name TEXT NOT NULL UNIQUE
        )",
        "CREATE TABLE IF NOT EXISTS message_flags (
            message_id INTEGER NOT NULL REFERENCES email_messages(id),
            flag_id INTEGER NOT NULL REFERENCES flags(flag_id),
            UNIQUE(message_id, flag_id)
        )",
    ];

    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }

    Ok(())
}

pub(crate) async fn resolve_user_id(
    conn: &mut SqliteConnection,
    host_id: i64,
    username: &str,
) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT user_id FROM users WHERE host_id = ? AND user_name = ?")
        .bind(host_id)
        .bind(username)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| MailError::NoSuchUser(username.to_string()))
}

async fn resolve_folder_id(
    conn: &mut SqliteConnection,
    user_id: i64,
    folder: &str,
) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT folder_id FROM folders WHERE user_id = ? AND folder_name = ?",
    )
    .bind(user_id)
    .bind(folder)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| MailError::Storage(format!("no such folder: {}", folder)))
}

/// Content-deduplicated body insert.
pub(crate) async fn resolve_body_id(conn: &mut SqliteConnection, content: &str) -> Result<i64> {
    let existing =
        sqlx::query_scalar::<_, i64>("SELECT body_id FROM mail_bodies WHERE body_content = ?")
            .bind(content)
            .fetch_optional(&mut *conn)
            .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    Ok(sqlx::query_scalar::<_, i64>(
        "INSERT INTO mail_bodies (body_content) VALUES (?) RETURNING body_id",
    )
    .bind(content)
    .fetch_one(conn)
    .await?)
}

/// Content-deduplicated attachment insert.
pub(crate) async fn resolve_attachment_id(
    conn: &mut SqliteConnection,
    data: &str,
) -> Result<i64> {
    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT attachment_id FROM mail_attachments WHERE attachment_data = ?",
    )
    .bind(data)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    Ok(sqlx::query_scalar::<_, i64>(
        "INSERT INTO mail_attachments (attachment_data) VALUES (?) RETURNING attachment_id",
    )
    .bind(data)
    .fetch_one(conn)
    .await?)
}

/// Direct insert path: one transaction per call.
pub(crate) async fn insert_mail_on(
    conn: &mut SqliteConnection,
    host_id: i64,
    sender: &str,
    recipients: &[String],
    subject: &str,
    body: &str,
    attachments: &[String],
) -> Result<()> {
    let mut tx = conn.begin().await?;
    write_mail_rows(&mut tx, host_id, sender, recipients, subject, body, attachments).await?;
    tx.commit().await?;
    Ok(())
}

/// Resolves ids and writes the message rows on the given connection without
/// transaction control; callers own the transaction boundary (the direct
/// path wraps one call, the write-behind drain wraps a whole batch).
pub(crate) async fn write_mail_rows(
    conn: &mut SqliteConnection,
    host_id: i64,
    sender: &str,
    recipients: &[String],
    subject: &str,
    body: &str,
    attachments: &[String],
) -> Result<()> {
    let sender_id = resolve_user_id(&mut *conn, host_id, sender).await?;

    let mut recipient_ids = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        recipient_ids.push(resolve_user_id(&mut *conn, host_id, recipient).await?);
    }

    let body_id = resolve_body_id(&mut *conn, body).await?;

    let mut attachment_ids = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        attachment_ids.push(resolve_attachment_id(&mut *conn, attachment).await?);
    }

    let sent_at = chrono::Utc::now().to_rfc3339();

    for recipient_id in &recipient_ids {
        if attachment_ids.is_empty() {
            sqlx::query(
                "INSERT INTO email_messages \
                 (sender_id, recipient_id, subject, body_id, is_received, sent_at) \
                 VALUES (?, ?, ?, ?, FALSE, ?)",
            )
            .bind(sender_id)
            .bind(recipient_id)
            .bind(subject)
            .bind(body_id)
            .bind(&sent_at)
            .execute(&mut *conn)
            .await?;
        } else {
            // One row per attachment, as in the reference schema
            for attachment_id in &attachment_ids {
                sqlx::query(
                    "INSERT INTO email_messages \
                     (sender_id, recipient_id, subject, body_id, attachment_id, is_received, sent_at) \
                     VALUES (?, ?, ?, ?, ?, FALSE, ?)",
                )
                .bind(sender_id)
                .bind(recipient_id)
                .bind(subject)
                .bind(body_id)
                .bind(attachment_id)
                .bind(&sent_at)
                .execute(&mut *conn)
                .await?;
            }
        }
    }

    Ok(())
}
