//! PostgreSQL driver backed by sqlx.
//!
//! Each pooled handle is a small `sqlx::PgPool` for one connection id, so a
//! single handle accepts concurrent queries from parallel requests (a table
//! page typically fires column, row, and count queries at once). Statements
//! run over the simple query protocol; values arrive in text format and are
//! decoded into JSON for display.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use super::{DatabaseDriver, DatabaseHandle, QueryResult, command_tag};
use crate::descriptor::{ConnectionDescriptor, ConnectionTarget, SslMode, key_value_pairs};
use crate::error::DriverError;

const APPLICATION_NAME: &str = "pgview";

/// Commands whose results are row sets.
const ROW_COMMANDS: &[&str] = &["SELECT", "WITH", "SHOW", "VALUES", "TABLE", "EXPLAIN", "FETCH"];

/// Per-handle driver settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PgDriverConfig {
    /// Sessions per handle (default: 5).
    pub max_connections: u32,
    /// Connect / session acquire timeout (default: 10s).
    pub connect_timeout: Duration,
}

impl Default for PgDriverConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// [`DatabaseDriver`] opening sqlx PostgreSQL pools.
#[derive(Clone, Debug, Default)]
pub struct PgDriver {
    config: PgDriverConfig,
}

impl PgDriver {
    pub fn new(config: PgDriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DatabaseDriver for PgDriver {
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DatabaseHandle>, DriverError> {
        let options = connect_options(descriptor)?;
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout)
            .connect_with(options)
            .await?;
        tracing::debug!(
            connection_id = descriptor.connection_id,
            max_connections = self.config.max_connections,
            "opened postgres handle"
        );
        Ok(Arc::new(PgHandle { pool }))
    }
}

/// Build sqlx connect options from a descriptor.
pub fn connect_options(descriptor: &ConnectionDescriptor) -> Result<PgConnectOptions, DriverError> {
    let options = match &descriptor.target {
        ConnectionTarget::Url(s) if s.starts_with("postgres://") || s.starts_with("postgresql://") => {
            PgConnectOptions::from_str(s)?
        }
        ConnectionTarget::Url(s) => options_from_key_value(s)?,
        ConnectionTarget::Params(p) => {
            let mut options = PgConnectOptions::new()
                .host(&p.host)
                .port(p.port)
                .username(&p.username)
                .database(&p.database)
                .ssl_mode(pg_ssl_mode(p.ssl_mode));
            if let Some(password) = &p.password {
                options = options.password(password);
            }
            options
        }
    };

    Ok(options.application_name(APPLICATION_NAME).options([(
        "statement_timeout",
        format!("{}ms", descriptor.query_timeout.as_millis()),
    )]))
}

fn options_from_key_value(s: &str) -> Result<PgConnectOptions, DriverError> {
    let mut options = PgConnectOptions::new();
    for (key, value) in key_value_pairs(s) {
        options = match key.as_str() {
            "host" | "hostaddr" => options.host(&value),
            "port" => options.port(
                value
                    .parse()
                    .map_err(|_| DriverError::new(format!("invalid port: {value}")))?,
            ),
            "user" => options.username(&value),
            "password" => options.password(&value),
            "dbname" => options.database(&value),
            "sslmode" => options.ssl_mode(PgSslMode::from_str(&value)?),
            _ => options,
        };
    }
    Ok(options)
}

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

fn returns_rows(command: &str, sql: &str) -> bool {
    ROW_COMMANDS.contains(&command) || has_returning_clause(sql)
}

/// True if `RETURNING` appears as a bare keyword outside quotes and comments.
fn has_returning_clause(sql: &str) -> bool {
    let mut word = String::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' || c == '$' {
            word.push(c);
            continue;
        }
        if word.eq_ignore_ascii_case("RETURNING") {
            return true;
        }
        word.clear();

        match c {
            // A doubled quote closes and reopens the literal.
            '\'' | '"' => {
                for q in chars.by_ref() {
                    if q == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            _ => {}
        }
    }
    word.eq_ignore_ascii_case("RETURNING")
}

#[derive(Debug)]
struct PgHandle {
    pool: PgPool,
}

#[async_trait]
impl DatabaseHandle for PgHandle {
    async fn execute(&self, sql: &str) -> Result<QueryResult, DriverError> {
        let command = command_tag(sql);

        if !returns_rows(&command, sql) {
            let done = sqlx::raw_sql(sql).execute(&self.pool).await?;
            return Ok(QueryResult {
                row_count: done.rows_affected(),
                command,
                ..QueryResult::default()
            });
        }

        let rows = sqlx::raw_sql(sql).fetch_all(&self.pool).await?;
        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let values: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| (0..row.len()).map(|idx| decode_value(row, idx)).collect())
            .collect();

        Ok(QueryResult {
            columns,
            row_count: values.len() as u64,
            rows: values,
            command,
            truncated: false,
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.pool.close().await;
        Ok(())
    }
}

fn decode_value(row: &PgRow, idx: usize) -> Value {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(idx).map(Value::from),
        "INT2" => row.try_get::<i16, _>(idx).map(Value::from),
        "INT4" => row.try_get::<i32, _>(idx).map(Value::from),
        "INT8" => row.try_get::<i64, _>(idx).map(Value::from),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(Value::from),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(Value::from),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|v| Value::String(v.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|v| Value::String(v.to_string())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|v| Value::String(v.to_string())),
        // Text-format values of any other type decode as their literal text.
        _ => row.try_get_unchecked::<String, _>(idx).map(Value::String),
    };

    decoded.unwrap_or_else(|_| Value::String(format!("<{}>", type_name.to_ascii_lowercase())))
}
