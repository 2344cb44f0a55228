//! Bounded database connection pool.
//!
//! A fixed set of SQLite connections behind a free-list. `acquire` hands out
//! a scoped lease and waits FIFO (semaphore order) until one is free or the
//! acquire timeout expires. The lease returns its connection on drop whether
//! or not the borrower's transaction committed.

use crate::error::{MailError, Result};
use sqlx::{Connection, SqliteConnection};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

/// Hard cap on pool size.
const MAX_DATABASE_CONNECTIONS: usize = 10;

/// How long `acquire` waits for a free connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(20);

struct PoolInner {
    free: Mutex<VecDeque<SqliteConnection>>,
    permits: Arc<Semaphore>,
    size: usize,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Opens `size` connections (capped at 10) against the given URL.
    pub async fn connect(url: &str, size: usize) -> Result<Self> {
        let size = size.clamp(1, MAX_DATABASE_CONNECTIONS);

        let mut free = VecDeque::with_capacity(size);
        for _ in 0..size {
            free.push_back(SqliteConnection::connect(url).await?);
        }

        debug!("Opened connection pool of {} against {}", size, url);

        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                permits: Arc::new(Semaphore::new(size)),
                size,
            }),
        })
    }

    /// Waits for a free connection, FIFO among waiters.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = timeout(
            ACQUIRE_TIMEOUT,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| MailError::PoolTimeout)?
        .map_err(|_| MailError::PoolTimeout)?;

        let conn = {
            let mut free = lock_free_list(&self.inner.free);
            free.pop_front()
        };

        match conn {
            Some(conn) => Ok(PooledConnection {
                conn: Some(conn),
                pool: self.inner.clone(),
                _permit: permit,
            }),
            // A permit guarantees a free connection; reaching this means the
            // free-list invariant was broken.
            None => Err(MailError::Storage("connection pool exhausted".to_string())),
        }
    }

    /// Number of connections currently in the free-list.
    pub fn free_count(&self) -> usize {
        lock_free_list(&self.inner.free).len()
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }
}

fn lock_free_list(
    free: &Mutex<VecDeque<SqliteConnection>>,
) -> std::sync::MutexGuard<'_, VecDeque<SqliteConnection>> {
    free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scoped lease on a pooled connection.
pub struct PooledConnection {
    conn: Option<SqliteConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        // `conn` is only None after drop
        self.conn.as_ref().expect("lease used after release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("lease used after release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Return the connection before the permit is released so the next
            // waiter always finds the list non-empty.
            lock_free_list(&self.pool.free).push_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_free_list_restored_after_leases() {
        let pool = ConnectionPool::connect("sqlite::memory:", 3).await.unwrap();
        assert_eq!(pool.free_count(), 3);

        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            assert_eq!(pool.free_count(), 1);
        }

        assert_eq!(pool.free_count(), 3);
    }

    #[tokio::test]
    async fn test_pool_size_is_capped() {
        let pool = ConnectionPool::connect("sqlite::memory:", 64).await.unwrap();
        assert_eq!(pool.size(), 10);
    }

    #[tokio::test]
    async fn test_waiter_gets_connection_on_release() {
        let pool = ConnectionPool::connect("sqlite::memory:", 1).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await.map(|_| ()) });

        // Give the waiter time to park on the semaphore, then release.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(lease);

        waiter.await.unwrap().unwrap();
        assert_eq!(pool.free_count(), 1);
    }
}
