//! Usage tracking — best-effort "last used" bookkeeping for connections.
//!
//! The pool marks a connection active after every successful acquisition and
//! the reaper marks it inactive after eviction. Writes run as detached tasks;
//! failures are logged and swallowed so database browsing is never blocked
//! by a bookkeeping write.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::descriptor::ConnectionId;
use crate::error::UsageError;

/// Persistence for connection activity state.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn set_active(
        &self,
        connection_id: ConnectionId,
        active: bool,
        last_used_at: Option<DateTime<Utc>>,
    ) -> Result<(), UsageError>;
}

/// Store that records nothing. Used when no application database is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopUsageStore;

#[async_trait]
impl UsageStore for NoopUsageStore {
    async fn set_active(
        &self,
        _connection_id: ConnectionId,
        _active: bool,
        _last_used_at: Option<DateTime<Utc>>,
    ) -> Result<(), UsageError> {
        Ok(())
    }
}

/// Writes activity state to the application's `database_connections` table.
#[derive(Clone, Debug)]
pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazily connect to the application database; sessions open on first write.
    pub fn connect_lazy(database_url: &str) -> Result<Self, UsageError> {
        let pool = PgPool::connect_lazy(database_url)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn set_active(
        &self,
        connection_id: ConnectionId,
        active: bool,
        last_used_at: Option<DateTime<Utc>>,
    ) -> Result<(), UsageError> {
        let done = sqlx::query(
            "UPDATE database_connections SET is_active = $1, last_used_at = $2 WHERE id = $3",
        )
        .bind(active)
        .bind(last_used_at)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(UsageError::NotFound(connection_id));
        }
        Ok(())
    }
}

/// Fire-and-forget front end over a [`UsageStore`].
#[derive(Clone)]
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker").finish_non_exhaustive()
    }
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// Tracker backed by [`NoopUsageStore`].
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopUsageStore))
    }

    /// Record `last_used_at = now, is_active = true`.
    ///
    /// The returned handle resolves once the write finished (or failed and
    /// was logged). Callers on the request path drop it.
    pub fn mark_active(&self, connection_id: ConnectionId) -> JoinHandle<()> {
        self.spawn_write(connection_id, true, Some(Utc::now()))
    }

    /// Record `last_used_at = NULL, is_active = false`.
    pub fn mark_inactive(&self, connection_id: ConnectionId) -> JoinHandle<()> {
        self.spawn_write(connection_id, false, None)
    }

    fn spawn_write(
        &self,
        connection_id: ConnectionId,
        active: bool,
        last_used_at: Option<DateTime<Utc>>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.set_active(connection_id, active, last_used_at).await {
                Ok(()) => {
                    tracing::trace!(connection_id, active, "usage recorded");
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id,
                        active,
                        error = %e,
                        "usage tracking write failed"
                    );
                }
            }
        })
    }
}
