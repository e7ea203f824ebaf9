//! PostgreSQL adapters for the relational stores.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use super::{DeviceStore, NewServer, ServerChanges, ServerStore};
use crate::error::{EngineError, Result};
use crate::types::{DeviceSummary, FleetServer, ServerId};

/// Connection handle for the relational side. Adapters borrow its pool.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: PgPool,
}

impl RelationalStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn servers(&self) -> PostgresServerStore {
        PostgresServerStore {
            pool: self.pool.clone(),
        }
    }

    pub fn devices(&self) -> PostgresDeviceStore {
        PostgresDeviceStore {
            pool: self.pool.clone(),
        }
    }

    async fn initialize_schema(&self) -> Result<()> {
        // No foreign key from device_summaries to fleet_servers: removal
        // deletes the server row before its device rows, and a constraint
        // would forbid that order.
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS fleet_servers (
                id BIGSERIAL PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                admin_name TEXT NOT NULL,
                admin_password TEXT NOT NULL,
                emergency_name TEXT,
                emergency_password TEXT,
                cron_limited TEXT NOT NULL,
                cron_expanded TEXT NOT NULL,
                org_name TEXT NOT NULL DEFAULT '',
                activation_code TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device_summaries (
                id BIGSERIAL PRIMARY KEY,
                external_id BIGINT NOT NULL,
                udid TEXT NOT NULL,
                serial_number TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL DEFAULT '',
                device_type TEXT NOT NULL,
                server_id BIGINT NOT NULL,
                last_synced TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS device_summaries_server_udid
               ON device_summaries(server_id, udid);"#,
            r#"CREATE INDEX IF NOT EXISTS device_summaries_udid
               ON device_summaries(udid);"#,
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresServerStore {
    pool: PgPool,
}

#[async_trait]
impl ServerStore for PostgresServerStore {
    async fn insert(&self, row: NewServer) -> Result<FleetServer> {
        let result = sqlx::query_as::<_, FleetServer>(
            r#"
            INSERT INTO fleet_servers
                (url, admin_name, admin_password, emergency_name,
                 emergency_password, cron_limited, cron_expanded,
                 org_name, activation_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&row.url)
        .bind(&row.admin_name)
        .bind(&row.admin_password)
        .bind(&row.emergency_name)
        .bind(&row.emergency_password)
        .bind(&row.cron_limited)
        .bind(&row.cron_expanded)
        .bind(&row.org_name)
        .bind(&row.activation_code)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(server) => Ok(server),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EngineError::UrlAlreadyRegistered(row.url))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<FleetServer>> {
        Ok(
            sqlx::query_as::<_, FleetServer>("SELECT * FROM fleet_servers ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn get(&self, id: ServerId) -> Result<Option<FleetServer>> {
        Ok(
            sqlx::query_as::<_, FleetServer>("SELECT * FROM fleet_servers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<FleetServer>> {
        Ok(
            sqlx::query_as::<_, FleetServer>("SELECT * FROM fleet_servers WHERE url = $1")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn update(&self, id: ServerId, changes: ServerChanges) -> Result<FleetServer> {
        sqlx::query_as::<_, FleetServer>(
            r#"
            UPDATE fleet_servers SET
                admin_name = COALESCE($2, admin_name),
                admin_password = COALESCE($3, admin_password),
                cron_limited = COALESCE($4, cron_limited),
                cron_expanded = COALESCE($5, cron_expanded),
                org_name = COALESCE($6, org_name),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&changes.admin_name)
        .bind(&changes.admin_password)
        .bind(&changes.cron_limited)
        .bind(&changes.cron_expanded)
        .bind(&changes.org_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::UnknownServer(id.to_string()))
    }

    async fn set_emergency(
        &self,
        url: &str,
        name: Option<String>,
        password: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE fleet_servers
            SET emergency_name = $2, emergency_password = $3, updated_at = now()
            WHERE url = $1
            "#,
        )
        .bind(url)
        .bind(&name)
        .bind(&password)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::UnknownServer(url.to_string()));
        }
        Ok(())
    }

    async fn take_emergency_password(&self, url: &str) -> Result<Option<String>> {
        // The inner select locks the row and carries the pre-update value,
        // so exactly one concurrent caller can observe it.
        let row = sqlx::query(
            r#"
            UPDATE fleet_servers AS f
            SET emergency_password = NULL, updated_at = now()
            FROM (
                SELECT id, emergency_password FROM fleet_servers
                WHERE url = $1 FOR UPDATE
            ) AS prior
            WHERE f.id = prior.id AND prior.emergency_password IS NOT NULL
            RETURNING prior.emergency_password AS taken
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("taken")?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: ServerId) -> Result<()> {
        let result = sqlx::query("DELETE FROM fleet_servers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::UnknownServer(id.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresDeviceStore {
    pool: PgPool,
}

fn summary_from_row(row: &PgRow) -> Result<DeviceSummary> {
    Ok(DeviceSummary {
        external_id: row.try_get("external_id")?,
        udid: row.try_get("udid")?,
        serial_number: row.try_get("serial_number")?,
        name: row.try_get("name")?,
        device_type: row.try_get::<String, _>("device_type")?.parse()?,
        server_id: row.try_get("server_id")?,
        last_synced: row.try_get("last_synced")?,
    })
}

#[async_trait]
impl DeviceStore for PostgresDeviceStore {
    async fn upsert_summary(&self, summary: &DeviceSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_summaries
                (external_id, udid, serial_number, name, device_type,
                 server_id, last_synced)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (server_id, udid) DO UPDATE SET
                external_id = EXCLUDED.external_id,
                serial_number = EXCLUDED.serial_number,
                name = EXCLUDED.name,
                device_type = EXCLUDED.device_type,
                last_synced = EXCLUDED.last_synced
            "#,
        )
        .bind(summary.external_id)
        .bind(&summary.udid)
        .bind(&summary.serial_number)
        .bind(&summary.name)
        .bind(summary.device_type.as_str())
        .bind(summary.server_id)
        .bind(summary.last_synced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_server(&self, server_id: ServerId) -> Result<Vec<DeviceSummary>> {
        let rows = sqlx::query(
            "SELECT * FROM device_summaries WHERE server_id = $1 ORDER BY external_id",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    async fn find_by_udid(&self, udid: &str) -> Result<Option<DeviceSummary>> {
        let row = sqlx::query("SELECT * FROM device_summaries WHERE udid = $1")
            .bind(udid)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(summary_from_row).transpose()
    }

    async fn delete_for_server(&self, server_id: ServerId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM device_summaries WHERE server_id = $1")
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
