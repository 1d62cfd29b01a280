//! Connection descriptor resolution.
//!
//! A [`ConnectionRecord`] is what the application stores per user-owned
//! connection: either an encrypted connection string or discrete
//! host/port/credential fields. [`resolve`] decrypts and normalizes it into a
//! [`ConnectionDescriptor`], the only form the driver ever sees. Descriptors
//! are held transiently while a handle is opened and never persisted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::cipher::CredentialCipher;
use crate::error::{PoolError, PoolResult};

/// Primary key of a stored connection configuration.
pub type ConnectionId = i64;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_QUERY_TIMEOUT_SECONDS: u32 = 30;
pub const DEFAULT_ROW_LIMIT: u32 = 1000;

/// How a stored record specifies its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    ConnectionString,
    Manual,
}

/// libpq `sslmode` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    Prefer,
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        f.write_str(s)
    }
}

/// A user's stored connection configuration. Secrets are ciphertext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub user_id: i64,
    pub connection_type: ConnectionType,
    /// Encrypted connection string (`connection_string` mode).
    pub connection_string: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// Encrypted password (`manual` mode).
    pub password: Option<String>,
    pub database: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    pub ssl_mode: Option<SslMode>,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u32,
    /// Maximum rows returned per query; 0 means unlimited.
    #[serde(default = "default_row_limit")]
    pub row_limit: u32,
    #[serde(default)]
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

fn default_query_timeout() -> u32 {
    DEFAULT_QUERY_TIMEOUT_SECONDS
}

fn default_row_limit() -> u32 {
    DEFAULT_ROW_LIMIT
}

impl ConnectionRecord {
    /// A `manual` record with defaults for everything but the target.
    pub fn manual(id: ConnectionId, host: &str, username: &str, database: &str) -> Self {
        Self {
            id,
            user_id: 0,
            connection_type: ConnectionType::Manual,
            connection_string: None,
            host: Some(host.to_string()),
            port: None,
            username: Some(username.to_string()),
            password: None,
            database: Some(database.to_string()),
            ssl: false,
            ssl_mode: None,
            query_timeout_seconds: DEFAULT_QUERY_TIMEOUT_SECONDS,
            row_limit: DEFAULT_ROW_LIMIT,
            is_active: false,
            last_used_at: None,
        }
    }

    /// A `connection_string` record; `encrypted` is the stored ciphertext.
    pub fn with_connection_string(id: ConnectionId, encrypted: &str) -> Self {
        Self {
            connection_type: ConnectionType::ConnectionString,
            connection_string: Some(encrypted.to_string()),
            host: None,
            username: None,
            database: None,
            ..Self::manual(id, "", "", "")
        }
    }
}

/// Decrypted, discrete connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
    pub ssl: bool,
    /// Effective mode: `Disable` whenever `ssl` is false.
    pub ssl_mode: SslMode,
}

#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// Decrypted URI or key=value connection string.
    Url(String),
    Params(ConnectionParams),
}

/// Everything needed to open a handle for one connection id.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub connection_id: ConnectionId,
    pub target: ConnectionTarget,
    pub query_timeout: Duration,
    /// 0 means unlimited.
    pub row_limit: u32,
}

// Secrets never reach logs.
impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("ConnectionDescriptor");
        d.field("connection_id", &self.connection_id);
        match &self.target {
            ConnectionTarget::Url(_) => {
                d.field("target", &"<connection string>");
            }
            ConnectionTarget::Params(p) => {
                d.field("host", &p.host)
                    .field("port", &p.port)
                    .field("username", &p.username)
                    .field("password", &p.password.as_ref().map(|_| "<redacted>"))
                    .field("database", &p.database)
                    .field("ssl_mode", &p.ssl_mode);
            }
        }
        d.field("query_timeout", &self.query_timeout)
            .field("row_limit", &self.row_limit)
            .finish()
    }
}

/// Build a descriptor from a stored record, decrypting its secrets.
pub fn resolve(
    record: &ConnectionRecord,
    cipher: &dyn CredentialCipher,
) -> PoolResult<ConnectionDescriptor> {
    let target = match record.connection_type {
        ConnectionType::ConnectionString => {
            let encrypted = non_blank(record.connection_string.as_deref()).ok_or_else(|| {
                PoolError::InvalidConfiguration(format!(
                    "connection {} has no connection string",
                    record.id
                ))
            })?;
            ConnectionTarget::Url(cipher.decrypt(encrypted)?)
        }
        ConnectionType::Manual => {
            let host = required(record, "host", record.host.as_deref())?;
            let username = required(record, "username", record.username.as_deref())?;
            let database = required(record, "database", record.database.as_deref())?;
            let password = match non_blank(record.password.as_deref()) {
                Some(encrypted) => Some(cipher.decrypt(encrypted)?),
                None => None,
            };
            let ssl_mode = if record.ssl {
                record.ssl_mode.unwrap_or_default()
            } else {
                SslMode::Disable
            };
            ConnectionTarget::Params(ConnectionParams {
                host: host.to_string(),
                port: record.port.unwrap_or(DEFAULT_PORT),
                username: username.to_string(),
                password,
                database: database.to_string(),
                ssl: record.ssl,
                ssl_mode,
            })
        }
    };

    let timeout_secs = match record.query_timeout_seconds {
        0 => DEFAULT_QUERY_TIMEOUT_SECONDS,
        n => n,
    };

    Ok(ConnectionDescriptor {
        connection_id: record.id,
        target,
        query_timeout: Duration::from_secs(u64::from(timeout_secs)),
        row_limit: record.row_limit,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn required<'a>(
    record: &ConnectionRecord,
    field: &str,
    value: Option<&'a str>,
) -> PoolResult<&'a str> {
    non_blank(value).ok_or_else(|| {
        PoolError::InvalidConfiguration(format!(
            "connection {} is missing required field `{field}`",
            record.id
        ))
    })
}

/// Display-only view of a connection string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ParsedConnectionString {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub database: Option<String>,
}

/// Best-effort extraction of host/port/user/database for display.
///
/// Understands `postgres://` / `postgresql://` URIs and libpq key=value
/// strings. Anything else yields all-`None`; this never fails.
pub fn parse_connection_string(s: &str) -> ParsedConnectionString {
    let s = s.trim();
    if s.starts_with("postgres://") || s.starts_with("postgresql://") {
        parse_uri(s).unwrap_or_default()
    } else if s.contains('=') {
        parse_key_value(s)
    } else {
        ParsedConnectionString::default()
    }
}

fn parse_uri(s: &str) -> Option<ParsedConnectionString> {
    let url = url::Url::parse(s).ok()?;
    let decode = |v: &str| percent_decode_str(v).decode_utf8_lossy().into_owned();
    let mut parsed = ParsedConnectionString {
        host: url.host_str().filter(|h| !h.is_empty()).map(str::to_string),
        port: url.port(),
        username: Some(url.username()).filter(|u| !u.is_empty()).map(decode),
        database: Some(url.path().trim_start_matches('/'))
            .filter(|d| !d.is_empty())
            .map(decode),
    };

    // Query parameters fill in whatever the authority left out
    // (e.g. `postgres:///db?host=/var/run/postgresql`).
    for (key, value) in url.query_pairs() {
        let value = value.into_owned();
        match key.as_ref() {
            "host" if parsed.host.is_none() => parsed.host = Some(value),
            "port" if parsed.port.is_none() => parsed.port = value.parse().ok(),
            "user" if parsed.username.is_none() => parsed.username = Some(value),
            "dbname" if parsed.database.is_none() => parsed.database = Some(value),
            _ => {}
        }
    }
    Some(parsed)
}

fn parse_key_value(s: &str) -> ParsedConnectionString {
    let mut parsed = ParsedConnectionString::default();
    for (key, value) in key_value_pairs(s) {
        match key.as_str() {
            "host" | "hostaddr" if parsed.host.is_none() => parsed.host = Some(value),
            "port" => parsed.port = value.parse().ok(),
            "user" => parsed.username = Some(value),
            "dbname" => parsed.database = Some(value),
            _ => {}
        }
    }
    parsed
}

/// Split `key=value key2='quoted value'` into pairs. Malformed tails are dropped.
pub(crate) fn key_value_pairs(s: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let key: String = std::iter::from_fn(|| chars.next_if(|c| *c != '=' && !c.is_whitespace()))
            .collect();
        if key.is_empty() {
            break;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            break;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '\'' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                break;
            }
        } else {
            value.extend(std::iter::from_fn(|| chars.next_if(|c| !c.is_whitespace())));
        }
        pairs.push((key, value));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CipherError;

    /// Cipher whose ciphertext is `enc:<plaintext>`.
    struct PrefixCipher;

    impl CredentialCipher for PrefixCipher {
        fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
            ciphertext
                .strip_prefix("enc:")
                .map(str::to_string)
                .ok_or(CipherError::Decrypt)
        }
    }

    fn params(descriptor: &ConnectionDescriptor) -> &ConnectionParams {
        match &descriptor.target {
            ConnectionTarget::Params(p) => p,
            ConnectionTarget::Url(_) => panic!("expected discrete params"),
        }
    }

    // ── resolve ────────────────────────────────────────────────────

    #[test]
    fn manual_record_resolves_with_defaults() {
        let mut record = ConnectionRecord::manual(7, "db.internal", "app", "shop");
        record.password = Some("enc:hunter2".to_string());

        let descriptor = resolve(&record, &PrefixCipher).unwrap();
        assert_eq!(descriptor.connection_id, 7);
        assert_eq!(descriptor.query_timeout, Duration::from_secs(30));
        assert_eq!(descriptor.row_limit, DEFAULT_ROW_LIMIT);

        let p = params(&descriptor);
        assert_eq!(p.host, "db.internal");
        assert_eq!(p.port, DEFAULT_PORT);
        assert_eq!(p.username, "app");
        assert_eq!(p.password.as_deref(), Some("hunter2"));
        assert_eq!(p.database, "shop");
        assert_eq!(p.ssl_mode, SslMode::Disable);
    }

    #[test]
    fn manual_record_without_host_is_invalid() {
        let mut record = ConnectionRecord::manual(3, "db", "app", "shop");
        record.host = None;
        let err = resolve(&record, &PrefixCipher).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfiguration(ref m) if m.contains("host")));

        record.host = Some("   ".to_string());
        assert!(matches!(
            resolve(&record, &PrefixCipher),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn manual_record_without_database_is_invalid() {
        let mut record = ConnectionRecord::manual(3, "db", "app", "shop");
        record.database = None;
        let err = resolve(&record, &PrefixCipher).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfiguration(ref m) if m.contains("database")));
    }

    #[test]
    fn ssl_mode_follows_ssl_flag() {
        let mut record = ConnectionRecord::manual(1, "db", "app", "shop");
        record.ssl_mode = Some(SslMode::VerifyFull);
        assert_eq!(params(&resolve(&record, &PrefixCipher).unwrap()).ssl_mode, SslMode::Disable);

        record.ssl = true;
        assert_eq!(
            params(&resolve(&record, &PrefixCipher).unwrap()).ssl_mode,
            SslMode::VerifyFull
        );

        record.ssl_mode = None;
        assert_eq!(params(&resolve(&record, &PrefixCipher).unwrap()).ssl_mode, SslMode::Require);
    }

    #[test]
    fn connection_string_record_is_decrypted() {
        let record =
            ConnectionRecord::with_connection_string(9, "enc:postgres://app@db.internal/shop");
        let descriptor = resolve(&record, &PrefixCipher).unwrap();
        assert!(matches!(
            descriptor.target,
            ConnectionTarget::Url(ref u) if u == "postgres://app@db.internal/shop"
        ));
    }

    #[test]
    fn connection_string_record_without_string_is_invalid() {
        let mut record = ConnectionRecord::with_connection_string(9, "");
        assert!(matches!(
            resolve(&record, &PrefixCipher),
            Err(PoolError::InvalidConfiguration(_))
        ));
        record.connection_string = None;
        assert!(matches!(
            resolve(&record, &PrefixCipher),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn undecryptable_secret_fails() {
        let mut record = ConnectionRecord::manual(4, "db", "app", "shop");
        record.password = Some("garbage".to_string());
        assert!(matches!(
            resolve(&record, &PrefixCipher),
            Err(PoolError::DecryptionFailed(_))
        ));

        let record = ConnectionRecord::with_connection_string(5, "garbage");
        assert!(matches!(
            resolve(&record, &PrefixCipher),
            Err(PoolError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn zero_query_timeout_falls_back_to_default() {
        let mut record = ConnectionRecord::manual(1, "db", "app", "shop");
        record.query_timeout_seconds = 0;
        let descriptor = resolve(&record, &PrefixCipher).unwrap();
        assert_eq!(descriptor.query_timeout, Duration::from_secs(30));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut record = ConnectionRecord::manual(1, "db", "app", "shop");
        record.password = Some("enc:hunter2".to_string());
        let debug = format!("{:?}", resolve(&record, &PrefixCipher).unwrap());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));

        let record = ConnectionRecord::with_connection_string(2, "enc:postgres://u:pw@h/d");
        let debug = format!("{:?}", resolve(&record, &PrefixCipher).unwrap());
        assert!(!debug.contains("pw@h"));
    }

    // ── parse_connection_string ────────────────────────────────────

    #[test]
    fn parses_uri_form() {
        let parsed = parse_connection_string("postgresql://app:pw@db.internal:6543/shop?sslmode=require");
        assert_eq!(parsed.host.as_deref(), Some("db.internal"));
        assert_eq!(parsed.port, Some(6543));
        assert_eq!(parsed.username.as_deref(), Some("app"));
        assert_eq!(parsed.database.as_deref(), Some("shop"));
    }

    #[test]
    fn uri_components_are_percent_decoded() {
        let parsed = parse_connection_string("postgres://team%40corp@db/my%20db");
        assert_eq!(parsed.username.as_deref(), Some("team@corp"));
        assert_eq!(parsed.database.as_deref(), Some("my db"));
        assert_eq!(parsed.port, None);
    }

    #[test]
    fn uri_query_parameters_fill_missing_fields() {
        let parsed = parse_connection_string("postgres:///shop?host=/var/run/postgresql&user=app");
        assert_eq!(parsed.host.as_deref(), Some("/var/run/postgresql"));
        assert_eq!(parsed.username.as_deref(), Some("app"));
        assert_eq!(parsed.database.as_deref(), Some("shop"));
    }

    #[test]
    fn parses_key_value_form() {
        let parsed =
            parse_connection_string("host=db.internal port=5433 user=app dbname='my shop' sslmode=require");
        assert_eq!(parsed.host.as_deref(), Some("db.internal"));
        assert_eq!(parsed.port, Some(5433));
        assert_eq!(parsed.username.as_deref(), Some("app"));
        assert_eq!(parsed.database.as_deref(), Some("my shop"));
    }

    #[test]
    fn key_value_tolerates_spaces_around_equals() {
        let parsed = parse_connection_string("host = db user= app");
        assert_eq!(parsed.host.as_deref(), Some("db"));
        assert_eq!(parsed.username.as_deref(), Some("app"));
    }

    #[test]
    fn unparseable_input_yields_all_none() {
        assert_eq!(parse_connection_string("not a connection string"), ParsedConnectionString::default());
        assert_eq!(parse_connection_string(""), ParsedConnectionString::default());
        assert_eq!(parse_connection_string("postgres://[bad"), ParsedConnectionString::default());
    }

    #[test]
    fn invalid_port_is_dropped() {
        let parsed = parse_connection_string("host=db port=abc");
        assert_eq!(parsed.host.as_deref(), Some("db"));
        assert_eq!(parsed.port, None);
    }
}
