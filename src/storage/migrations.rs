//! Database migration helpers.
//!
//! Applies the schema statements once each, recording them in a
//! `_migrations` table.

use std::collections::HashSet;

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations. Returns the number applied.
    ///
    /// Idempotent: applied statements are skipped, and each statement uses
    /// IF NOT EXISTS.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let pending = self.pending_migrations().await?;
        let statements = schema::all_schema_statements();

        for name in &pending {
            let Some(statement) = migration_index(name).and_then(|idx| statements.get(idx)) else {
                continue;
            };
            self.apply_migration(name, statement).await?;
        }

        if pending.is_empty() {
            debug!("Database schema is up to date");
        } else {
            info!(applied = pending.len(), "Applied database migrations");
        }
        Ok(pending.len())
    }

    /// Names of schema statements not yet recorded as applied, in order.
    pub async fn pending_migrations(&self) -> Result<Vec<String>, MigrationError> {
        let applied: HashSet<String> = self
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|migration| migration.name)
            .collect();

        Ok((0..schema::all_schema_statements().len())
            .map(migration_name)
            .filter(|name| !applied.contains(name))
            .collect())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(migration = %name, "Applied migration");

        Ok(())
    }

    /// Returns a list of applied migrations.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_migrations_table().await?;

        let migrations: Vec<AppliedMigration> =
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY applied_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(migrations)
    }

    /// Drops all tables, including the migration log.
    ///
    /// **WARNING**: This will destroy all job data.
    pub async fn reset_database(&self) -> Result<(), MigrationError> {
        let drop_statements = [
            "DROP TABLE IF EXISTS srm_job_history CASCADE",
            "DROP TABLE IF EXISTS srm_jobs CASCADE",
            "DROP TABLE IF EXISTS _migrations CASCADE",
        ];

        for statement in drop_statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MigrationError::MigrationFailed(format!("Drop failed: {}", e)))?;
        }

        Ok(())
    }
}

const MIGRATION_PREFIX: &str = "srm_schema_v1_part_";

fn migration_name(idx: usize) -> String {
    format!("{}{}", MIGRATION_PREFIX, idx)
}

fn migration_index(name: &str) -> Option<usize> {
    name.strip_prefix(MIGRATION_PREFIX)?.parse().ok()
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }

    #[test]
    fn test_migration_names_are_stable() {
        assert_eq!(migration_name(0), "srm_schema_v1_part_0");
        assert_eq!(migration_name(4), "srm_schema_v1_part_4");
        assert_eq!(migration_index(&migration_name(3)), Some(3));
        assert_eq!(migration_index("schema_v1_part_3"), None);
    }
}
