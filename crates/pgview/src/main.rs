//! pgview — command-line front end for the pgview connection pool.
//!
//! Loads stored connection records from a TOML file and drives them through
//! one `ConnectionPool`:
//! - `check`: open every configured connection concurrently
//! - `query`: run one statement and print the result as JSON
//! - `encrypt`: produce a stored secret for a connection record
//!
//! # Usage
//!
//! ```text
//! pgview check --config pgview.toml
//! pgview query --config pgview.toml --connection 7 "select now()"
//! PGVIEW_ENCRYPTION_KEY=<64 hex chars> pgview encrypt 's3cret'
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use pgview_pool::config::DEFAULT_KEY_ENV;
use pgview_pool::driver::postgres::PgDriver;
use pgview_pool::usage::PgUsageStore;
use pgview_pool::{
    AesGcmCipher, ConnectionOptions, ConnectionPool, IdleReaper, PgViewConfig, UsageTracker,
};

#[derive(Parser)]
#[command(name = "pgview", about = "Inspect stored PostgreSQL connections")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open every configured connection and report which succeed.
    Check {
        /// Path to the pgview configuration file.
        #[arg(long, default_value = "pgview.toml")]
        config: PathBuf,
    },

    /// Run a statement on one connection and print the result as JSON.
    Query {
        #[arg(long, default_value = "pgview.toml")]
        config: PathBuf,

        /// Connection id from the configuration file.
        #[arg(long)]
        connection: i64,

        /// SQL to execute.
        sql: String,
    },

    /// Encrypt a secret with the master key for use in a connection record.
    Encrypt {
        /// Environment variable holding the hex-encoded master key.
        #[arg(long, default_value = DEFAULT_KEY_ENV)]
        key_env: String,

        plaintext: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pgview=debug,pgview_pool=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => {
            let config = PgViewConfig::from_file(&config)?;
            with_pool(&config, |pool| run_check(pool, &config)).await
        }
        Command::Query {
            config,
            connection,
            sql,
        } => {
            let config = PgViewConfig::from_file(&config)?;
            with_pool(&config, |pool| run_query(pool, &config, connection, &sql)).await
        }
        Command::Encrypt { key_env, plaintext } => {
            let cipher = AesGcmCipher::from_env(&key_env)
                .with_context(|| format!("loading master key from ${key_env}"))?;
            println!("{}", cipher.encrypt(&plaintext)?);
            Ok(())
        }
    }
}

fn build_pool(config: &PgViewConfig) -> anyhow::Result<ConnectionPool> {
    let key_env = config.key_env();
    let cipher = AesGcmCipher::from_env(key_env)
        .with_context(|| format!("loading master key from ${key_env}"))?;

    let tracker = match config.usage.database_url.as_deref() {
        Some(url) => {
            let store = PgUsageStore::connect_lazy(url).context("configuring usage database")?;
            info!("usage tracking enabled");
            UsageTracker::new(Arc::new(store))
        }
        None => UsageTracker::disabled(),
    };

    Ok(ConnectionPool::new(
        config.pool_config()?,
        Arc::new(PgDriver::new(config.driver_config()?)),
        Arc::new(cipher),
        tracker,
    ))
}

/// Run `f` against a fresh pool with its reaper, then tear both down, also
/// on Ctrl-C.
async fn with_pool<F, Fut>(config: &PgViewConfig, f: F) -> anyhow::Result<()>
where
    F: FnOnce(ConnectionPool) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let pool = build_pool(config)?;
    let reaper = IdleReaper::spawn(pool.clone(), pool.config().sweep_interval);

    let outcome = tokio::select! {
        result = f(pool.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Err(anyhow!("interrupted"))
        }
    };

    reaper.stop().await;
    pool.log_stats().await;
    pool.shutdown().await;
    outcome
}

async fn run_check(pool: ConnectionPool, config: &PgViewConfig) -> anyhow::Result<()> {
    if config.connections.is_empty() {
        bail!("no connections configured");
    }

    let results = futures::future::join_all(config.connections.iter().map(|record| {
        let pool = pool.clone();
        async move {
            let result = pool.get_connection(record, ConnectionOptions::default()).await;
            (record.id, result)
        }
    }))
    .await;

    let mut failed = 0usize;
    for (id, result) in &results {
        match result {
            Ok(conn) => println!("connection {id}: ok (generation {})", conn.generation()),
            Err(e) => {
                failed += 1;
                println!("connection {id}: FAILED: {e}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} connections failed", results.len());
    }
    info!(connections = results.len(), "all connections opened");
    Ok(())
}

async fn run_query(
    pool: ConnectionPool,
    config: &PgViewConfig,
    connection_id: i64,
    sql: &str,
) -> anyhow::Result<()> {
    let record = config
        .connection(connection_id)
        .ok_or_else(|| anyhow!("connection {connection_id} is not configured"))?;

    let conn = pool.get_connection(record, ConnectionOptions::default()).await?;
    let result = conn.query(sql).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_command() {
        let cli = Cli::try_parse_from([
            "pgview",
            "query",
            "--connection",
            "7",
            "select 1",
        ])
        .unwrap();
        match cli.command {
            Command::Query {
                config,
                connection,
                sql,
            } => {
                assert_eq!(config, PathBuf::from("pgview.toml"));
                assert_eq!(connection, 7);
                assert_eq!(sql, "select 1");
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn encrypt_defaults_key_env() {
        let cli = Cli::try_parse_from(["pgview", "encrypt", "s3cret"]).unwrap();
        match cli.command {
            Command::Encrypt { key_env, plaintext } => {
                assert_eq!(key_env, DEFAULT_KEY_ENV);
                assert_eq!(plaintext, "s3cret");
            }
            _ => panic!("expected encrypt command"),
        }
    }

    #[test]
    fn query_requires_connection_id() {
        assert!(Cli::try_parse_from(["pgview", "query", "select 1"]).is_err());
    }
}
