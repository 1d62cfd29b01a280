//! Pool entries — per-connection-id slot state and the pooled handle.
//!
//! A slot moves `Creating → Live` and is then removed from the map by idle
//! eviction, invalidation, or shutdown. It never moves backward; a fresh
//! slot replaces a removed one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::descriptor::ConnectionId;
use crate::driver::{DatabaseHandle, QueryResult};
use crate::error::{DriverError, PoolError, PoolResult};

/// In-flight creation shared by every caller that observed it.
pub(crate) type SharedInit = Shared<BoxFuture<'static, PoolResult<Arc<PooledConnection>>>>;

/// Live database handle owned by the pool and lent to callers.
///
/// Callers hold it via `Arc` for the duration of a request. Once the pool
/// closes it (eviction, invalidation, shutdown) it rejects further queries
/// with [`PoolError::HandleClosed`].
pub struct PooledConnection {
    connection_id: ConnectionId,
    generation: u64,
    handle: Arc<dyn DatabaseHandle>,
    closed: AtomicBool,
    query_timeout: Duration,
    row_limit: u32,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_id", &self.connection_id)
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .field("query_timeout", &self.query_timeout)
            .field("row_limit", &self.row_limit)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub(crate) fn new(
        connection_id: ConnectionId,
        generation: u64,
        handle: Arc<dyn DatabaseHandle>,
        query_timeout: Duration,
        row_limit: u32,
    ) -> Self {
        Self {
            connection_id,
            generation,
            handle,
            closed: AtomicBool::new(false),
            query_timeout,
            row_limit,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Creation attempt that produced this handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Run a statement bounded by the connection's configured query timeout.
    pub async fn query(&self, sql: &str) -> PoolResult<QueryResult> {
        self.query_with_timeout(sql, self.query_timeout).await
    }

    /// Run a statement bounded by `timeout`.
    ///
    /// A timed-out query is abandoned; the handle itself stays open for other
    /// callers sharing it.
    pub async fn query_with_timeout(&self, sql: &str, timeout: Duration) -> PoolResult<QueryResult> {
        if self.is_closed() {
            return Err(PoolError::HandleClosed);
        }

        match tokio::time::timeout(timeout, self.handle.execute(sql)).await {
            Ok(Ok(result)) => Ok(result.truncate(self.row_limit)),
            Ok(Err(e)) => Err(PoolError::QueryFailed(e.to_string())),
            Err(_) => {
                tracing::warn!(
                    connection_id = self.connection_id,
                    timeout = ?timeout,
                    "query timed out"
                );
                Err(PoolError::QueryTimeout(timeout))
            }
        }
    }

    /// Mark closed and release the underlying handle. Only the first call
    /// reaches the driver.
    pub(crate) async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.handle.close().await
    }
}

/// Slot state for one connection id.
pub(crate) enum EntryState {
    Creating(SharedInit),
    Live(Arc<PooledConnection>),
}

pub(crate) struct PoolEntry {
    /// Creation attempt owning this slot; a finishing creation only settles
    /// the slot if the generation still matches.
    pub(crate) generation: u64,
    pub(crate) state: EntryState,
    pub(crate) last_accessed_at: Instant,
}

impl PoolEntry {
    pub(crate) fn creating(generation: u64, init: SharedInit) -> Self {
        Self {
            generation,
            state: EntryState::Creating(init),
            last_accessed_at: Instant::now(),
        }
    }

    pub(crate) fn live(conn: Arc<PooledConnection>) -> Self {
        Self {
            generation: conn.generation(),
            state: EntryState::Live(conn),
            last_accessed_at: Instant::now(),
        }
    }

    pub(crate) fn is_creating(&self) -> bool {
        matches!(self.state, EntryState::Creating(_))
    }

    /// True for a live slot unused for longer than `idle_timeout`.
    pub(crate) fn is_idle(&self, idle_timeout: Duration, now: Instant) -> bool {
        !self.is_creating() && now.saturating_duration_since(self.last_accessed_at) > idle_timeout
    }

    pub(crate) fn touch(&mut self) {
        self.last_accessed_at = Instant::now();
    }
}
