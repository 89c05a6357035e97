//! Database connection and pool management

use mailflock_common::config::DatabaseConfig;
use mailflock_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// SQLSTATE for serialization failures under concurrent transactions
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for detected deadlocks
const DEADLOCK_DETECTED: &str = "40P01";

/// Database pool wrapper
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("Database URL required for PostgreSQL".to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Translate a driver error into the crate error kind callers branch on.
pub fn db_error(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::RowNotFound => Error::NotFound("Row not found".to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            Error::TransientStorageFailure(err.to_string())
        }
        sqlx::Error::Database(ref db) => {
            if db.is_unique_violation() {
                return Error::Conflict(db.message().to_string());
            }
            match db.code().as_deref() {
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    Error::TransientStorageFailure(db.message().to_string())
                }
                _ => Error::Database(err.to_string()),
            }
        }
        other => Error::Database(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        assert!(matches!(
            db_error(sqlx::Error::RowNotFound),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = db_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::TransientStorageFailure(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_errors_map_to_database() {
        let err = db_error(sqlx::Error::ColumnNotFound("email".to_string()));
        assert!(matches!(err, Error::Database(_)));
    }
}
