//! Write-behind mail writer.
//!
//! Buffers fully-materialised mail records in a bounded queue and drains them
//! on a fixed interval, packaging each drain into a single transaction on a
//! dedicated connection. Producers never block: a full queue is an error the
//! session maps to a transient SMTP reply.

use crate::error::{MailError, Result};
use crate::store;
use sqlx::{Connection, SqliteConnection};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A mail record waiting to be flushed. Attachments are already in their
/// encoded wire form.
#[derive(Debug, Clone)]
pub struct QueuedMail {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<String>,
}

pub struct MailWriter {
    queue: Arc<Mutex<VecDeque<QueuedMail>>>,
    max_queue_size: usize,
    stop: CancellationToken,
    worker: AsyncMutex<Option<JoinHandle<()>>>,
}

impl MailWriter {
    /// Starts the background drain task on its own connection.
    pub fn spawn(
        conn: SqliteConnection,
        host_id: i64,
        max_queue_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let queue: Arc<Mutex<VecDeque<QueuedMail>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stop = CancellationToken::new();

        let worker_queue = queue.clone();
        let worker_stop = stop.clone();
        let worker = tokio::spawn(async move {
            run_worker(conn, host_id, worker_queue, worker_stop, flush_interval).await;
        });

        info!(
            "Write-behind mail writer started (queue {}, interval {:?})",
            max_queue_size, flush_interval
        );

        Self {
            queue,
            max_queue_size,
            stop,
            worker: AsyncMutex::new(Some(worker)),
        }
    }

    /// Queues a record, failing fast when the queue is at capacity.
    pub fn enqueue(&self, mail: QueuedMail) -> Result<()> {
        let mut queue = lock_queue(&self.queue);
        if queue.len() >= self.max_queue_size {
            return Err(MailError::QueueFull);
        }
        queue.push_back(mail);
        Ok(())
    }

    pub fn queued(&self) -> usize {
        lock_queue(&self.queue).len()
    }

    /// Stops the worker after a final drain.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Mail writer task failed: {}", e);
            }
        }
    }
}

fn lock_queue(
    queue: &Mutex<VecDeque<QueuedMail>>,
) -> std::sync::MutexGuard<'_, VecDeque<QueuedMail>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_worker(
    mut conn: SqliteConnection,
    host_id: i64,
    queue: Arc<Mutex<VecDeque<QueuedMail>>>,
    stop: CancellationToken,
    flush_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            _ = stop.cancelled() => {
                // Final drain so accepted mail is not lost on shutdown
                drain(&mut conn, host_id, &queue).await;
                info!("Mail writer stopped");
                return;
            }
        }

        drain(&mut conn, host_id, &queue).await;
    }
}

/// Takes the whole queue and writes it in FIFO order. `sent_at` is assigned
/// here, at drain time.
async fn drain(
    conn: &mut SqliteConnection,
    host_id: i64,
    queue: &Arc<Mutex<VecDeque<QueuedMail>>>,
) {
    let batch: Vec<QueuedMail> = {
        let mut queue = lock_queue(queue);
        queue.drain(..).collect()
    };

    if batch.is_empty() {
        return;
    }

    debug!("Flushing {} queued mail record(s)", batch.len());

    if let Err(e) = flush_batch(conn, host_id, &batch).await {
        error!("Failed to flush {} queued mail record(s): {}", batch.len(), e);
    }
}

/// Writes a whole batch as one transaction, in FIFO order.
async fn flush_batch(
    conn: &mut SqliteConnection,
    host_id: i64,
    batch: &[QueuedMail],
) -> Result<()> {
    let mut tx = conn.begin().await?;

    for mail in batch {
        store::write_mail_rows(
            &mut tx,
            host_id,
            &mail.sender,
            &mail.recipients,
            &mail.subject,
            &mail.body,
            &mail.attachments,
        )
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
