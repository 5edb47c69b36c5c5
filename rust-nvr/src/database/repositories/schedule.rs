//! Schedule repository (read-only from the engine's perspective).

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use crate::Result;
use crate::database::models::ScheduleDbModel;
use crate::domain::Schedule;

/// Schedule repository trait.
///
/// Schedules are owned by the CRUD layer; the engine only reads them.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// All active schedules, validated into domain types.
    ///
    /// Rows that fail validation are skipped, not fatal: one malformed
    /// schedule must not take down recording for every other camera.
    async fn list_active(&self) -> Result<Vec<Schedule>>;
}

/// SQLx implementation of [`ScheduleRepository`].
pub struct SqlxScheduleRepository {
    pool: SqlitePool,
}

impl SqlxScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleRepository for SqlxScheduleRepository {
    async fn list_active(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleDbModel>(
            "SELECT * FROM schedules WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.into_domain() {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => warn!(schedule_id = id, error = %e, "Skipping invalid schedule row"),
            }
        }
        Ok(schedules)
    }
}
