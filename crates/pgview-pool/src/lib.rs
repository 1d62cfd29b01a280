//! pgview-pool — per-connection PostgreSQL handle pool for pgview.
//!
//! Given a user's stored (encrypted) connection record, the pool produces a
//! live database handle and reuses it across requests:
//! - **descriptor**: stored record → decrypted, normalized connection descriptor
//! - **cipher**: credential decryption capability (AES-256-GCM implementation)
//! - **driver**: database driver seam, with a sqlx-backed PostgreSQL driver
//! - **entry**: pooled handle wrapper and per-id slot state
//! - **pool**: single-flight get-or-create, invalidation, shutdown
//! - **reaper**: cancellable background sweep evicting idle handles
//! - **usage**: best-effort "last used" / "inactive" bookkeeping
//! - **config**: pool settings and the `pgview.toml` file format
//!
//! # Architecture
//!
//! ```text
//! handler calls get_connection(record)
//!   → live slot for record.id    → refresh last access, return handle
//!   → creating slot              → await the same in-flight open
//!   → no slot                    → resolve descriptor, install placeholder,
//!                                  spawn open (+ probe), settle slot
//!   → on success                 → UsageTracker::mark_active (fire-and-forget)
//!
//! IdleReaper tick
//!   → remove live slots idle past idle_timeout (creating slots skipped)
//!   → close handles, UsageTracker::mark_inactive
//! ```

pub mod cipher;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod entry;
pub mod error;
pub mod pool;
pub mod reaper;
pub mod usage;

pub use cipher::{AesGcmCipher, CredentialCipher};
pub use config::{PgViewConfig, PoolConfig};
pub use descriptor::{
    ConnectionDescriptor, ConnectionId, ConnectionRecord, ConnectionType, SslMode,
    parse_connection_string, resolve,
};
pub use driver::{DatabaseDriver, DatabaseHandle, QueryResult};
pub use entry::PooledConnection;
pub use error::{DriverError, PoolError, PoolResult};
pub use pool::{ConnectionOptions, ConnectionPool, PoolStats};
pub use reaper::{IdleReaper, IdleReaperHandle};
pub use usage::{NoopUsageStore, UsageStore, UsageTracker};
