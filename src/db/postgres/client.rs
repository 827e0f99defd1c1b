use anyhow::Context;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use log::info;
use tokio_postgres::NoTls;

use crate::config::PostgresSettings;

/// Split SQL into statements, respecting dollar-quoted strings.
/// Enum creation is wrapped in `DO $$ ... $$` blocks that contain semicolons.
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_dollar_quote = false;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'$') {
            in_dollar_quote = !in_dollar_quote;
            i += 2;
            continue;
        }

        if bytes[i] == b';' && !in_dollar_quote {
            let stmt = &sql[start..i];
            if !stmt.trim().is_empty() {
                statements.push(stmt);
            }
            start = i + 1;
        }
        i += 1;
    }

    let tail = &sql[start..];
    if !tail.trim().is_empty() {
        statements.push(tail);
    }

    statements
}

const SCHEMA_PATH: &str = "schema/postgres.sql";

const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// PostgreSQL client with connection pooling.
///
/// Implements [`Store`](crate::db::Store) on top of the `lpscope` schema.
/// Uses `deadpool-postgres` for connection management.
#[derive(Clone)]
pub struct PostgresClient {
    pub pool: Pool,
}

impl PostgresClient {
    pub async fn new(settings: PostgresSettings) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL");

        let mut retries = 0;
        #[allow(unused_assignments)]
        let mut last_error: Option<anyhow::Error> = None;

        loop {
            let mut pg_config = tokio_postgres::Config::new();
            pg_config
                .host(&settings.host)
                .port(settings.port)
                .user(&settings.user)
                .password(&settings.password)
                .dbname(&settings.database);

            let mgr_config = ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            };

            let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
            let pool = Pool::builder(mgr)
                .max_size(settings.pool_size)
                .build()
                .context("Failed to create PostgreSQL connection pool")?;

            // Test the connection
            match pool.get().await {
                Ok(_conn) => {
                    info!(
                        "Connected to PostgreSQL at {}:{}/{}",
                        settings.host, settings.port, settings.database
                    );
                    return Ok(Self { pool });
                },
                Err(e) => {
                    let error_msg = e.to_string();
                    last_error = Some(anyhow::anyhow!("{}", error_msg));
                    retries += 1;

                    if retries >= MAX_CONNECT_ATTEMPTS {
                        break;
                    }

                    let delay = std::time::Duration::from_millis(100 * 2_u64.pow(retries));
                    log::warn!(
                        "Failed to connect to PostgreSQL (attempt {}/{}), retrying in {:?}...",
                        retries,
                        MAX_CONNECT_ATTEMPTS,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }

        Err(anyhow::anyhow!(
            "Failed to connect to PostgreSQL after {} attempts: {}",
            MAX_CONNECT_ATTEMPTS,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string())
        ))
    }

    /// Health check - verify connection is still alive
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .context("PostgreSQL health check failed")?;
        Ok(())
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        info!("Running PostgreSQL migrations");
        let client = self.pool.get().await?;

        let schema = tokio::fs::read_to_string(SCHEMA_PATH)
            .await
            .with_context(|| format!("Failed to read {}", SCHEMA_PATH))?;

        // Split SQL statements properly, respecting dollar-quoted strings (e.g. DO blocks)
        let statements = split_sql_statements(&schema);
        for stmt in &statements {
            let stmt = stmt.trim();
            client
                .execute(stmt, &[])
                .await
                .with_context(|| format!("Failed to execute migration statement: {}", stmt))?;
        }

        info!(
            "PostgreSQL schema applied successfully ({} statements)",
            statements.len()
        );
        Ok(())
    }
}
