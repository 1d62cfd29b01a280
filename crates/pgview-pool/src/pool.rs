//! Connection pool — one live handle per connection id.
//!
//! Acquisitions for the same id are single-flight: the first caller installs
//! a creating placeholder and spawns the open, later callers await the same
//! shared future. The map lock is never held across driver I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cipher::CredentialCipher;
use crate::config::PoolConfig;
use crate::descriptor::{ConnectionDescriptor, ConnectionId, ConnectionRecord, resolve};
use crate::driver::{DatabaseDriver, DatabaseHandle};
use crate::entry::{EntryState, PoolEntry, PooledConnection, SharedInit};
use crate::error::{DriverError, PoolError, PoolResult};
use crate::usage::UsageTracker;

/// Statement used to verify a freshly opened handle.
const PROBE_SQL: &str = "SELECT 1";

/// Per-acquisition options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Record the acquisition with the usage tracker (default: true).
    pub update_last_used: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            update_last_used: true,
        }
    }
}

/// Snapshot of slot counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live: usize,
    pub creating: usize,
}

/// Shared pool of database handles keyed by connection id.
///
/// Cloning is cheap; all clones address the same map.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    driver: Arc<dyn DatabaseDriver>,
    cipher: Arc<dyn CredentialCipher>,
    tracker: UsageTracker,
    entries: Mutex<HashMap<ConnectionId, PoolEntry>>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        driver: Arc<dyn DatabaseDriver>,
        cipher: Arc<dyn CredentialCipher>,
        tracker: UsageTracker,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                driver,
                cipher,
                tracker,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Return the live handle for `record.id`, opening one if needed.
    ///
    /// Descriptor errors (missing fields, undecryptable secrets) return
    /// immediately and leave nothing cached. An open failure is delivered to
    /// every caller waiting on that attempt; the next call starts fresh.
    pub async fn get_connection(
        &self,
        record: &ConnectionRecord,
        options: ConnectionOptions,
    ) -> PoolResult<Arc<PooledConnection>> {
        let conn = self.acquire(record).await?;
        if options.update_last_used {
            let _ = self.inner.tracker.mark_active(record.id);
        }
        Ok(conn)
    }

    async fn acquire(&self, record: &ConnectionRecord) -> PoolResult<Arc<PooledConnection>> {
        let connection_id = record.id;

        // A joined attempt can settle into a slot that is evicted before this
        // waiter resumes; such a handle is already closed and is never returned.
        loop {
            let init = {
                let mut entries = self.inner.entries.lock().await;
                if self.is_shut_down() {
                    return Err(PoolError::ShutDown);
                }

                match entries.get_mut(&connection_id) {
                    Some(entry) => match &entry.state {
                        EntryState::Live(conn) => {
                            let conn = Arc::clone(conn);
                            entry.touch();
                            tracing::debug!(
                                connection_id,
                                generation = conn.generation(),
                                "reusing pooled connection"
                            );
                            return Ok(conn);
                        }
                        EntryState::Creating(init) => {
                            tracing::debug!(
                                connection_id,
                                generation = entry.generation,
                                "joining in-flight connection attempt"
                            );
                            init.clone()
                        }
                    },
                    None => {
                        let descriptor = resolve(record, self.inner.cipher.as_ref())?;
                        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(connection_id, generation, "opening connection");
                        let init = spawn_create(Arc::clone(&self.inner), descriptor, generation);
                        entries.insert(connection_id, PoolEntry::creating(generation, init.clone()));
                        init
                    }
                }
            };

            match init.await {
                Ok(conn) if conn.is_closed() => {
                    tracing::debug!(
                        connection_id,
                        generation = conn.generation(),
                        "joined connection was closed before hand-off, retrying"
                    );
                }
                result => return result,
            }
        }
    }

    /// Drop the slot for `connection_id` and close its handle.
    ///
    /// Idempotent. If the slot is still creating, the placeholder is removed
    /// and the attempt's handle is closed as soon as it opens.
    pub async fn invalidate(&self, connection_id: ConnectionId) {
        let removed = self.inner.entries.lock().await.remove(&connection_id);

        match removed {
            Some(PoolEntry {
                state: EntryState::Live(conn),
                ..
            }) => {
                if let Err(e) = conn.close().await {
                    tracing::warn!(
                        connection_id,
                        error = %e,
                        "failed to close invalidated connection"
                    );
                }
                tracing::info!(
                    connection_id,
                    generation = conn.generation(),
                    "invalidated connection"
                );
            }
            Some(entry) => {
                tracing::info!(
                    connection_id,
                    generation = entry.generation,
                    "invalidated in-flight connection attempt"
                );
            }
            None => {
                tracing::debug!(connection_id, "invalidate: no pooled connection");
            }
        }
    }

    /// Stop accepting acquisitions and close every pooled handle.
    ///
    /// In-flight attempts lose their slot; their handles are closed when they
    /// finish and their waiters receive [`PoolError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<PoolEntry> = {
            let mut entries = self.inner.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };

        let mut closed = 0usize;
        let mut abandoned = 0usize;
        for entry in drained {
            match entry.state {
                EntryState::Live(conn) => {
                    if let Err(e) = conn.close().await {
                        tracing::warn!(
                            connection_id = conn.connection_id(),
                            error = %e,
                            "failed to close connection during shutdown"
                        );
                    }
                    closed += 1;
                }
                EntryState::Creating(_) => abandoned += 1,
            }
        }

        tracing::info!(closed, abandoned, "connection pool shut down");
    }

    /// Evict live slots unused for longer than the idle timeout.
    ///
    /// Creating slots are skipped. Returns the evicted ids in ascending order.
    pub async fn sweep_idle(&self) -> Vec<ConnectionId> {
        let idle_timeout = self.inner.config.idle_timeout;

        let mut reaped: Vec<Arc<PooledConnection>> = {
            let mut entries = self.inner.entries.lock().await;
            let now = Instant::now();
            let idle: Vec<ConnectionId> = entries
                .iter()
                .filter(|(_, entry)| entry.is_idle(idle_timeout, now))
                .map(|(id, _)| *id)
                .collect();

            idle.into_iter()
                .filter_map(|id| match entries.remove(&id) {
                    Some(PoolEntry {
                        state: EntryState::Live(conn),
                        ..
                    }) => Some(conn),
                    _ => None,
                })
                .collect()
        };
        reaped.sort_unstable_by_key(|conn| conn.connection_id());

        let mut ids = Vec::with_capacity(reaped.len());
        for conn in reaped {
            let connection_id = conn.connection_id();
            if let Err(e) = conn.close().await {
                tracing::warn!(
                    connection_id,
                    error = %e,
                    "failed to close idle connection"
                );
            }
            let _ = self.inner.tracker.mark_inactive(connection_id);
            ids.push(connection_id);
        }

        if !ids.is_empty() {
            tracing::info!(
                reaped = ids.len(),
                idle_timeout = ?idle_timeout,
                "reaped idle connections"
            );
        }
        ids
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.inner.entries.lock().await;
        let creating = entries.values().filter(|entry| entry.is_creating()).count();
        PoolStats {
            live: entries.len() - creating,
            creating,
        }
    }

    /// True if a live or creating slot exists for `connection_id`.
    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.inner.entries.lock().await.contains_key(&connection_id)
    }

    /// Log slot counts at `tracing::info` level.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        tracing::info!(
            live = stats.live,
            creating = stats.creating,
            idle_timeout = ?self.inner.config.idle_timeout,
            shut_down = self.is_shut_down(),
            "pool statistics"
        );
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Run the open on its own task so the slot settles even if every waiter
/// is cancelled.
fn spawn_create(inner: Arc<PoolInner>, descriptor: ConnectionDescriptor, generation: u64) -> SharedInit {
    let connection_id = descriptor.connection_id;
    let task = tokio::spawn(Arc::clone(&inner).create(descriptor, generation));

    async move {
        match task.await {
            Ok(result) => result,
            Err(e) => {
                inner.remove_if_current(connection_id, generation).await;
                tracing::warn!(connection_id, generation, error = %e, "connection task aborted");
                Err(PoolError::ConnectionFailed(format!("connection task aborted: {e}")))
            }
        }
    }
    .boxed()
    .shared()
}

impl PoolInner {
    async fn create(
        self: Arc<Self>,
        descriptor: ConnectionDescriptor,
        generation: u64,
    ) -> PoolResult<Arc<PooledConnection>> {
        let connection_id = descriptor.connection_id;

        let handle = match self.open(&descriptor).await {
            Ok(handle) => handle,
            Err(e) => {
                self.remove_if_current(connection_id, generation).await;
                tracing::warn!(
                    connection_id,
                    generation,
                    error = %e,
                    "failed to open connection"
                );
                return Err(PoolError::ConnectionFailed(e.to_string()));
            }
        };

        let conn = Arc::new(PooledConnection::new(
            connection_id,
            generation,
            handle,
            descriptor.query_timeout,
            descriptor.row_limit,
        ));

        let installed = {
            let mut entries = self.entries.lock().await;
            let current = entries
                .get(&connection_id)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                entries.insert(connection_id, PoolEntry::live(Arc::clone(&conn)));
            }
            current
        };

        if installed {
            tracing::debug!(connection_id, generation, "connection ready");
            return Ok(conn);
        }

        // The slot was invalidated or the pool shut down while opening.
        if let Err(e) = conn.close().await {
            tracing::warn!(
                connection_id,
                generation,
                error = %e,
                "failed to close discarded connection"
            );
        }
        tracing::debug!(connection_id, generation, "discarded connection opened for a dropped slot");
        if self.shut_down.load(Ordering::Acquire) {
            Err(PoolError::ShutDown)
        } else {
            Err(PoolError::Invalidated(connection_id))
        }
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn DatabaseHandle>, DriverError> {
        let handle = self.driver.open(descriptor).await?;
        if !self.config.probe_on_connect {
            return Ok(handle);
        }

        let probe = match tokio::time::timeout(descriptor.query_timeout, handle.execute(PROBE_SQL)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(DriverError::new(format!(
                "liveness probe timed out after {:?}",
                descriptor.query_timeout
            ))),
        };

        if let Err(e) = probe {
            if let Err(close_err) = handle.close().await {
                tracing::warn!(
                    connection_id = descriptor.connection_id,
                    error = %close_err,
                    "failed to close handle after failed probe"
                );
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Remove the slot only if it still belongs to `generation`.
    async fn remove_if_current(&self, connection_id: ConnectionId, generation: u64) {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&connection_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(&connection_id);
        }
    }
}
