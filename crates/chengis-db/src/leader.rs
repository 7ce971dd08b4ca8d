//! Advisory-lock leader election.
//!
//! On the production store this is a PostgreSQL session advisory lock held
//! on a pinned connection; at most one process holds it. The development
//! lock always acquires (single-process assumption).

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres};
use tokio::sync::Mutex;
use tracing::debug;

use crate::DbResult;

#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Try to take the lock; false means another process holds it.
    async fn try_acquire(&self, lock_id: i64) -> DbResult<bool>;

    /// Release if held; returns whether anything was released.
    async fn release(&self, lock_id: i64) -> DbResult<bool>;
}

/// PostgreSQL advisory-lock implementation. Session locks live on the
/// connection, so the lock-holding connection is pinned here for as long as
/// leadership lasts.
pub struct PgLeaderLock {
    pool: PgPool,
    held: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgLeaderLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LeaderLock for PgLeaderLock {
    async fn try_acquire(&self, lock_id: i64) -> DbResult<bool> {
        let mut held = self.held.lock().await;
        if let Some(conn) = held.as_mut() {
            // Already leading; verify the pinned session is still alive.
            if conn.ping().await.is_ok() {
                return Ok(true);
            }
            *held = None;
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            debug!(lock_id, "advisory lock acquired");
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn release(&self, lock_id: i64) -> DbResult<bool> {
        let mut held = self.held.lock().await;
        let Some(mut conn) = held.take() else {
            return Ok(false);
        };
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await?;
        debug!(lock_id, released, "advisory lock released");
        Ok(released)
    }
}

/// Development lock: acquire always succeeds.
#[derive(Debug, Default)]
pub struct DevLeaderLock {
    held: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl LeaderLock for DevLeaderLock {
    async fn try_acquire(&self, _lock_id: i64) -> DbResult<bool> {
        self.held.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(true)
    }

    async fn release(&self, _lock_id: i64) -> DbResult<bool> {
        Ok(self.held.swap(false, std::sync::atomic::Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_lock_always_acquires() {
        let lock = DevLeaderLock::default();
        assert!(lock.try_acquire(42).await.unwrap());
        assert!(lock.try_acquire(42).await.unwrap());
        assert!(lock.release(42).await.unwrap());
        assert!(!lock.release(42).await.unwrap());
    }
}
