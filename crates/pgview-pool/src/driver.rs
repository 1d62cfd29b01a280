//! Database driver seam.
//!
//! The pool never speaks a wire protocol itself. It opens handles through a
//! [`DatabaseDriver`] and runs SQL through the resulting [`DatabaseHandle`].
//! [`postgres::PgDriver`] is the production implementation; tests inject
//! mock drivers that count `open` calls.

pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::descriptor::ConnectionDescriptor;
use crate::error::DriverError;

/// Opens live handles from connection descriptors.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Establish a new handle. Connect latency is bounded by the driver's own
    /// connect timeout.
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DatabaseHandle>, DriverError>;
}

/// A live database session (or driver-managed group of sessions) that accepts
/// concurrent query submission.
#[async_trait]
pub trait DatabaseHandle: Send + Sync + std::fmt::Debug {
    async fn execute(&self, sql: &str) -> Result<QueryResult, DriverError>;

    /// Release the underlying session(s).
    async fn close(&self) -> Result<(), DriverError>;
}

/// Result of a single statement.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Rows returned (before truncation) or affected.
    pub row_count: u64,
    /// Leading SQL keyword, upper-cased (`SELECT`, `UPDATE`, ...).
    pub command: String,
    /// True when rows were dropped to honor the connection's row limit.
    pub truncated: bool,
}

impl QueryResult {
    /// Drop rows past `limit` (0 = unlimited).
    pub fn truncate(mut self, limit: u32) -> Self {
        let limit = limit as usize;
        if limit > 0 && self.rows.len() > limit {
            self.rows.truncate(limit);
            self.truncated = true;
        }
        self
    }
}

/// Upper-cased first keyword of a statement, skipping leading comments.
pub fn command_tag(sql: &str) -> String {
    let mut rest = sql.trim_start();
    loop {
        if let Some(line_comment) = rest.strip_prefix("--") {
            rest = line_comment.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(block) = rest.strip_prefix("/*") {
            rest = block.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            break;
        }
    }
    rest.split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}
