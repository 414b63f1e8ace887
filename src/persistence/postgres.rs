//! Postgres-backed position store. Snapshots are stored whole as JSONB;
//! the indexed columns exist for queries and operator visibility.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::Position;
use crate::error::Result;

use super::store::PositionStore;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| sqlx::Error::from(e))?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PositionStore for PostgresStore {
    #[instrument(skip(self, position), fields(position_id = %position.id, state = position.state.as_str()))]
    async fn save_position(&self, position: &Position) -> Result<()> {
        let snapshot = serde_json::to_value(position)?;
        sqlx::query(
            r#"
            INSERT INTO positions (id, state, symbol, venue, account, snapshot, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET state = EXCLUDED.state,
                snapshot = EXCLUDED.snapshot,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(position.id)
        .bind(position.state.as_str())
        .bind(&position.plan.symbol)
        .bind(position.plan.venue.as_str())
        .bind(&position.plan.account)
        .bind(snapshot)
        .bind(position.created_at)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot FROM positions
            WHERE state NOT IN ('closed', 'stopped_out', 'entry_failed')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let snapshot: serde_json::Value = row.try_get("snapshot")?;
            positions.push(serde_json::from_value(snapshot)?);
        }
        Ok(positions)
    }

    async fn load_position(&self, id: Uuid) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT snapshot FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let snapshot: serde_json::Value = row.try_get("snapshot")?;
                Ok(Some(serde_json::from_value(snapshot)?))
            }
            None => Ok(None),
        }
    }
}
