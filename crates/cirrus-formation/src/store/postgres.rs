//! PostgreSQL store implementation.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{FormationError, FormationResult};
use crate::types::{
    EnvironmentStatus, ExperimentId, ExperimentRecord, ExperimentStatus, HackathonId,
    ResourceRecord, VirtualEnvironment,
};

use super::{FormationStore, ResourceFilter};

/// PostgreSQL-backed experiment store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL using the configured pool settings.
    ///
    /// The required tables are created if they don't exist.
    pub async fn connect(config: &DatabaseConfig) -> FormationResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> FormationResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> FormationResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                hackathon_id TEXT NOT NULL,
                status TEXT NOT NULL,
                environments JSONB NOT NULL DEFAULT '[]'::jsonb,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS formation_resources (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                label TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL,
                status TEXT NOT NULL,
                backend_key_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_formation_resources_kind_name
            ON formation_resources (kind, name)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_experiments_hackathon
            ON experiments (hackathon_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_experiment(row: &PgRow) -> FormationResult<ExperimentRecord> {
        let id: String = row.get("id");
        let hackathon_id: String = row.get("hackathon_id");
        let status_str: String = row.get("status");
        let environments_json: serde_json::Value = row.get("environments");
        let error: Option<String> = row.get("error");
        let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
        let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");

        let environments: Vec<VirtualEnvironment> = serde_json::from_value(environments_json)
            .map_err(|e| {
                FormationError::Serialisation(format!("failed to deserialise environments: {e}"))
            })?;

        let status: ExperimentStatus = status_str.parse().map_err(|e| {
            FormationError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        Ok(ExperimentRecord {
            id: ExperimentId::new(id),
            hackathon_id: HackathonId::new(hackathon_id),
            status,
            environments,
            created_at,
            updated_at,
            error,
        })
    }

    fn row_to_resource(row: &PgRow) -> FormationResult<ResourceRecord> {
        let kind_str: String = row.get("kind");
        let kind = kind_str.parse().map_err(|e| {
            FormationError::Serialisation(format!("failed to parse kind '{kind_str}': {e}"))
        })?;

        Ok(ResourceRecord {
            kind,
            name: row.get("name"),
            label: row.get("label"),
            description: row.get("description"),
            location: row.get("location"),
            status: row.get("status"),
            backend_key_id: row.get("backend_key_id"),
            created_at: row.get("created_at"),
        })
    }

    fn environments_json(environments: &[VirtualEnvironment]) -> FormationResult<serde_json::Value> {
        serde_json::to_value(environments).map_err(|e| {
            FormationError::Serialisation(format!("failed to serialise environments: {e}"))
        })
    }

    /// Append the filter's predicates to `query`, returning the bind values.
    fn filter_clause(filter: &ResourceFilter, query: &mut String) -> Vec<String> {
        let mut params = vec![filter.kind.as_str().to_owned()];
        query.push_str(" WHERE kind = $1");

        if let Some(ref name) = filter.name {
            params.push(name.clone());
            query.push_str(&format!(" AND name = ${}", params.len()));
        }

        if let Some(ref key_id) = filter.backend_key_id {
            params.push(key_id.clone());
            query.push_str(&format!(" AND backend_key_id = ${}", params.len()));
        }

        params
    }
}

#[async_trait]
impl FormationStore for PostgresStore {
    async fn insert_experiment(&self, record: &ExperimentRecord) -> FormationResult<()> {
        let environments = Self::environments_json(&record.environments)?;

        sqlx::query(
            r#"
            INSERT INTO experiments (
                id, hackathon_id, status, environments, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.hackathon_id.as_str())
        .bind(record.status.as_str())
        .bind(&environments)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_experiment(&self, id: &ExperimentId) -> FormationResult<Option<ExperimentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, hackathon_id, status, environments, error, created_at, updated_at
            FROM experiments
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_experiment).transpose()
    }

    async fn save_experiment(&self, record: &ExperimentRecord) -> FormationResult<()> {
        let environments = Self::environments_json(&record.environments)?;

        let result = sqlx::query(
            r#"
            UPDATE experiments
            SET status = $1, environments = $2, error = $3, updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(record.status.as_str())
        .bind(&environments)
        .bind(&record.error)
        .bind(record.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FormationError::ExperimentNotFound(record.id.to_string()));
        }

        Ok(())
    }

    async fn update_status(
        &self,
        id: &ExperimentId,
        status: ExperimentStatus,
        error: Option<&str>,
    ) -> FormationResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE experiments
            SET status = $1, error = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FormationError::ExperimentNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn update_environment_status(
        &self,
        id: &ExperimentId,
        name: &str,
        status: EnvironmentStatus,
    ) -> FormationResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT environments FROM experiments WHERE id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| FormationError::ExperimentNotFound(id.to_string()))?;

        let environments_json: serde_json::Value = row.get("environments");
        let mut environments: Vec<VirtualEnvironment> = serde_json::from_value(environments_json)
            .map_err(|e| {
                FormationError::Serialisation(format!("failed to deserialise environments: {e}"))
            })?;

        let environment = environments
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| {
                FormationError::invalid(format!("experiment {id} has no environment {name}"))
            })?;
        environment.status = status;

        sqlx::query(
            r#"
            UPDATE experiments
            SET environments = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(Self::environments_json(&environments)?)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_resources(&self, filter: &ResourceFilter) -> FormationResult<u64> {
        let mut query = String::from("SELECT COUNT(*) AS count FROM formation_resources");
        let params = Self::filter_clause(filter, &mut query);

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let row = sqlx_query.fetch_one(&self.pool).await?;
        let count: i64 = row.get("count");
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_resources(&self, filter: &ResourceFilter) -> FormationResult<u64> {
        let mut query = String::from("DELETE FROM formation_resources");
        let params = Self::filter_clause(filter, &mut query);

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let result = sqlx_query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_resource(&self, record: &ResourceRecord) -> FormationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO formation_resources (
                kind, name, label, description, location, status, backend_key_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.kind.as_str())
        .bind(&record.name)
        .bind(&record.label)
        .bind(&record.description)
        .bind(&record.location)
        .bind(&record.status)
        .bind(&record.backend_key_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_resources(&self, filter: &ResourceFilter) -> FormationResult<Vec<ResourceRecord>> {
        let mut query = String::from(
            r#"
            SELECT kind, name, label, description, location, status, backend_key_id, created_at
            FROM formation_resources
            "#,
        );
        let params = Self::filter_clause(filter, &mut query);
        query.push_str(" ORDER BY created_at ASC");

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_resource).collect()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
