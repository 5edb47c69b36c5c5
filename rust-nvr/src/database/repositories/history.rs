//! Recording history repository.
//!
//! Terminal-state writes are the most important guarantee in the engine:
//! they are the durable record of whether a recording actually happened.
//! The repository enforces the one-way state machine, and
//! [`DurableHistoryWriter`] adds the journal fallback for writes that fail.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, error, warn};

use crate::database::journal::{TerminalJournal, TerminalWrite};
use crate::database::models::{
    HistoryFilters, NewRecordingHistory, RecordingHistoryDbModel, RecordingStatus,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time;
use crate::domain::RecordingKey;
use crate::{Error, Result};

/// Recording history repository trait.
#[async_trait]
pub trait RecordingHistoryRepository: Send + Sync {
    /// Insert a new row in `recording` state, returning its id.
    async fn append(&self, record: &NewRecordingHistory) -> Result<i64>;

    async fn get(&self, id: i64) -> Result<RecordingHistoryDbModel>;

    /// Transition a row into a terminal state.
    ///
    /// Returns `true` when the transition happened, `false` when the row was
    /// already terminal (duplicate-event races are tolerated, never applied).
    /// A non-terminal target status is refused outright.
    async fn update_terminal(
        &self,
        id: i64,
        status: RecordingStatus,
        end_time: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<bool>;

    async fn query(&self, filters: &HistoryFilters) -> Result<Vec<RecordingHistoryDbModel>>;

    /// Keys whose recording reached `completed` or `stopped` today
    /// (`[start_of_day, end_of_day)` of the local calendar day).
    async fn terminal_keys_today(&self, now: DateTime<Local>) -> Result<HashSet<RecordingKey>>;

    async fn has_terminal_today(&self, key: &RecordingKey, now: DateTime<Local>) -> Result<bool>;

    /// Mark lingering `recording` rows for this key (or sharing the output
    /// filename) as `stopped`. Self-healing against orphaned rows.
    async fn finalize_stale(
        &self,
        key: &RecordingKey,
        filename: &str,
        end_time: DateTime<Utc>,
    ) -> Result<u64>;

    /// Mark every `recording` row as `stopped`. Startup recovery: such rows
    /// belonged to encoder processes of a previous daemon run.
    async fn finalize_all_recording(&self, end_time: DateTime<Utc>) -> Result<u64>;
}

/// SQLx implementation of [`RecordingHistoryRepository`].
pub struct SqlxRecordingHistoryRepository {
    pool: SqlitePool,
}

impl SqlxRecordingHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordingHistoryRepository for SqlxRecordingHistoryRepository {
    async fn append(&self, record: &NewRecordingHistory) -> Result<i64> {
        retry_on_sqlite_busy("history append", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO recording_history
                    (schedule_id, camera_id, camera_name, filename, start_time, status)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.schedule_id)
            .bind(record.camera_id)
            .bind(&record.camera_name)
            .bind(&record.filename)
            .bind(time::datetime_to_ms(record.start_time))
            .bind(RecordingStatus::Recording.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<RecordingHistoryDbModel> {
        sqlx::query_as::<_, RecordingHistoryDbModel>("SELECT * FROM recording_history WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("RecordingHistory", id))
    }

    async fn update_terminal(
        &self,
        id: i64,
        status: RecordingStatus,
        end_time: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: RecordingStatus::Recording.to_string(),
                to: status.to_string(),
            });
        }

        let affected = retry_on_sqlite_busy("history terminal update", || async {
            let result = sqlx::query(
                r#"
                UPDATE recording_history
                SET status = ?, end_time = ?, error_message = ?
                WHERE id = ? AND status = 'recording'
                "#,
            )
            .bind(status.as_str())
            .bind(time::datetime_to_ms(end_time))
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 1 {
            return Ok(true);
        }

        // Either the row is gone or it already reached a terminal state.
        let row = self.get(id).await?;
        debug!(
            history_id = id,
            current = %row.status,
            requested = %status,
            "Terminal state already set, ignoring duplicate transition"
        );
        Ok(false)
    }

    async fn query(&self, filters: &HistoryFilters) -> Result<Vec<RecordingHistoryDbModel>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM recording_history WHERE 1 = 1");

        if let Some(camera_name) = &filters.camera_name {
            builder.push(" AND camera_name = ").push_bind(camera_name);
        }
        if let Some(schedule_id) = filters.schedule_id {
            builder.push(" AND schedule_id = ").push_bind(schedule_id);
        }
        if let Some(status) = filters.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(from) = filters.from {
            builder
                .push(" AND start_time >= ")
                .push_bind(time::datetime_to_ms(from));
        }
        if let Some(to) = filters.to {
            builder
                .push(" AND start_time < ")
                .push_bind(time::datetime_to_ms(to));
        }
        builder.push(" ORDER BY start_time DESC");

        let rows = builder
            .build_query_as::<RecordingHistoryDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn terminal_keys_today(&self, now: DateTime<Local>) -> Result<HashSet<RecordingKey>> {
        let (day_start, day_end) = time::local_day_bounds_ms(now);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT DISTINCT camera_name, schedule_id FROM recording_history
            WHERE status IN ('completed', 'stopped') AND end_time >= ? AND end_time < ?
            "#,
        )
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(camera_name, schedule_id)| RecordingKey::new(camera_name, schedule_id))
            .collect())
    }

    async fn has_terminal_today(&self, key: &RecordingKey, now: DateTime<Local>) -> Result<bool> {
        let (day_start, day_end) = time::local_day_bounds_ms(now);
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM recording_history
                WHERE camera_name = ? AND schedule_id = ?
                  AND status IN ('completed', 'stopped')
                  AND end_time >= ? AND end_time < ?
            )
            "#,
        )
        .bind(&key.camera_name)
        .bind(key.schedule_id)
        .bind(day_start)
        .bind(day_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 != 0)
    }

    async fn finalize_stale(
        &self,
        key: &RecordingKey,
        filename: &str,
        end_time: DateTime<Utc>,
    ) -> Result<u64> {
        let result = retry_on_sqlite_busy("stale history finalize", || async {
            let result = sqlx::query(
                r#"
                UPDATE recording_history
                SET status = 'stopped', end_time = ?
                WHERE status = 'recording'
                  AND ((camera_name = ? AND schedule_id = ?) OR filename = ?)
                "#,
            )
            .bind(time::datetime_to_ms(end_time))
            .bind(&key.camera_name)
            .bind(key.schedule_id)
            .bind(filename)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if result > 0 {
            warn!(key = %key, rows = result, "Finalized orphaned recording rows");
        }
        Ok(result)
    }

    async fn finalize_all_recording(&self, end_time: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE recording_history SET status = 'stopped', end_time = ? WHERE status = 'recording'",
        )
        .bind(time::datetime_to_ms(end_time))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// History writer that never loses a terminal transition.
///
/// The primary transactional write is attempted first; on failure the
/// transition is appended to the terminal-write journal for replay at the
/// next startup. If both fail, the loss is logged as a durability violation
/// so the caller can still release its in-memory state.
#[derive(Clone)]
pub struct DurableHistoryWriter {
    repo: Arc<dyn RecordingHistoryRepository>,
    journal: Arc<TerminalJournal>,
}

impl DurableHistoryWriter {
    pub fn new(repo: Arc<dyn RecordingHistoryRepository>, journal: Arc<TerminalJournal>) -> Self {
        Self { repo, journal }
    }

    pub fn repository(&self) -> &Arc<dyn RecordingHistoryRepository> {
        &self.repo
    }

    /// Record a terminal transition, falling back to the journal on failure.
    pub async fn mark_terminal(
        &self,
        history_id: i64,
        status: RecordingStatus,
        end_time: DateTime<Utc>,
        error_message: Option<&str>,
    ) {
        match self
            .repo
            .update_terminal(history_id, status, end_time, error_message)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                warn!(
                    history_id,
                    %status,
                    error = %e,
                    "Primary history write failed, falling back to journal"
                );
                let entry = TerminalWrite {
                    history_id,
                    status,
                    end_time_ms: time::datetime_to_ms(end_time),
                    error_message: error_message.map(str::to_string),
                };
                if let Err(e) = self.journal.append(&entry).await {
                    error!(
                        history_id,
                        %status,
                        error = %e,
                        "Durability violation: terminal state lost on both write paths"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool_with_size, run_migrations};

    async fn repo() -> SqlxRecordingHistoryRepository {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqlxRecordingHistoryRepository::new(pool)
    }

    fn new_record(camera: &str, schedule_id: i64) -> NewRecordingHistory {
        NewRecordingHistory {
            schedule_id,
            camera_id: 1,
            camera_name: camera.to_string(),
            filename: format!("/rec/{camera}/{schedule_id}.mp4"),
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_starts_in_recording() {
        let repo = repo().await;
        let id = repo.append(&new_record("cam", 1)).await.unwrap();
        let row = repo.get(id).await.unwrap();
        assert_eq!(row.status(), Some(RecordingStatus::Recording));
        assert!(row.end_time.is_none());
    }

    #[tokio::test]
    async fn test_terminal_transition_is_write_once() {
        let repo = repo().await;
        let id = repo.append(&new_record("cam", 1)).await.unwrap();

        let applied = repo
            .update_terminal(id, RecordingStatus::Stopped, Utc::now(), None)
            .await
            .unwrap();
        assert!(applied);

        // A duplicate event must not flip the terminal state.
        let applied = repo
            .update_terminal(id, RecordingStatus::Error, Utc::now(), Some("late event"))
            .await
            .unwrap();
        assert!(!applied);

        let row = repo.get(id).await.unwrap();
        assert_eq!(row.status(), Some(RecordingStatus::Stopped));
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn test_update_refuses_non_terminal_target() {
        let repo = repo().await;
        let id = repo.append(&new_record("cam", 1)).await.unwrap();
        let err = repo
            .update_terminal(id, RecordingStatus::Recording, Utc::now(), None)
            .await;
        assert!(matches!(err, Err(Error::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let repo = repo().await;
        let err = repo
            .update_terminal(999, RecordingStatus::Stopped, Utc::now(), None)
            .await;
        assert!(matches!(err, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_terminal_keys_today_excludes_errors_and_other_days() {
        let repo = repo().await;
        let now = Local::now();

        let completed = repo.append(&new_record("cam-a", 1)).await.unwrap();
        repo.update_terminal(completed, RecordingStatus::Completed, Utc::now(), None)
            .await
            .unwrap();

        let errored = repo.append(&new_record("cam-b", 2)).await.unwrap();
        repo.update_terminal(errored, RecordingStatus::Error, Utc::now(), Some("boom"))
            .await
            .unwrap();

        // Terminal yesterday: outside today's range.
        let yesterday = repo.append(&new_record("cam-c", 3)).await.unwrap();
        repo.update_terminal(
            yesterday,
            RecordingStatus::Stopped,
            Utc::now() - chrono::Duration::days(1),
            None,
        )
        .await
        .unwrap();

        let keys = repo.terminal_keys_today(now).await.unwrap();
        assert!(keys.contains(&RecordingKey::new("cam-a", 1)));
        assert!(!keys.contains(&RecordingKey::new("cam-b", 2)));
        assert!(!keys.contains(&RecordingKey::new("cam-c", 3)));

        assert!(
            repo.has_terminal_today(&RecordingKey::new("cam-a", 1), now)
                .await
                .unwrap()
        );
        assert!(
            !repo
                .has_terminal_today(&RecordingKey::new("cam-b", 2), now)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_finalize_stale_only_touches_matching_recording_rows() {
        let repo = repo().await;
        let stale = repo.append(&new_record("cam", 1)).await.unwrap();
        let other = repo.append(&new_record("other", 9)).await.unwrap();

        let touched = repo
            .finalize_stale(&RecordingKey::new("cam", 1), "/elsewhere.mp4", Utc::now())
            .await
            .unwrap();
        assert_eq!(touched, 1);

        assert_eq!(
            repo.get(stale).await.unwrap().status(),
            Some(RecordingStatus::Stopped)
        );
        assert_eq!(
            repo.get(other).await.unwrap().status(),
            Some(RecordingStatus::Recording)
        );
    }

    #[tokio::test]
    async fn test_query_filters() {
        let repo = repo().await;
        let a = repo.append(&new_record("cam-a", 1)).await.unwrap();
        repo.append(&new_record("cam-b", 2)).await.unwrap();
        repo.update_terminal(a, RecordingStatus::Completed, Utc::now(), None)
            .await
            .unwrap();

        let rows = repo
            .query(&HistoryFilters::new().with_camera_name("cam-a"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].camera_name, "cam-a");

        let completed = repo
            .query(&HistoryFilters::new().with_status(RecordingStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }
}
