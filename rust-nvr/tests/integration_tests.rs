//! End-to-end lifecycle tests against a scripted encoder.
//!
//! The encoder seam is swapped for a deterministic implementation so the
//! full start / monitor / finalize / reconcile paths run without ffmpeg.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rust_nvr::database::models::{HistoryFilters, RecordingStatus};
use rust_nvr::database::journal::TerminalJournal;
use rust_nvr::database::repositories::{
    DurableHistoryWriter, RecordingHistoryRepository, ScheduleRepository, SettingsRepository,
    SqlxRecordingHistoryRepository, SqlxScheduleRepository, SqlxSettingsRepository,
};
use rust_nvr::database::{init_pool_with_size, run_migrations, DbPool};
use rust_nvr::domain::{RecordingKey, RecordingOutput, Schedule};
use rust_nvr::recorder::{
    Encoder, EncoderEvent, EncoderHandle, EncoderJob, RecorderConfig, RecorderManager, StopReason,
};
use rust_nvr::scheduler::{ReconcilerConfig, ReconciliationService, TickReport};
use rust_nvr::{Error, Result};

/// What the scripted encoder does after spawning.
#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Write `output_bytes` then exit with `code`.
    ExitImmediately { code: i32, output_bytes: usize },
    /// Write `output_bytes` then block until the token is cancelled.
    RunUntilCancelled { output_bytes: usize },
    /// Fail the spawn itself.
    FailSpawn,
}

/// Deterministic stand-in for the ffmpeg subprocess.
struct ScriptedEncoder {
    behavior: Behavior,
    spawns: Mutex<HashMap<String, usize>>,
}

impl ScriptedEncoder {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            spawns: Mutex::new(HashMap::new()),
        })
    }

    fn spawn_count(&self, key: &RecordingKey) -> usize {
        self.spawns.lock().get(&key.to_string()).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn start(&self, job: &EncoderJob, token: CancellationToken) -> Result<EncoderHandle> {
        *self.spawns.lock().entry(job.key.to_string()).or_insert(0) += 1;

        let output_bytes = match self.behavior {
            Behavior::FailSpawn => return Err(Error::encoder("scripted spawn failure")),
            Behavior::ExitImmediately { output_bytes, .. } => output_bytes,
            Behavior::RunUntilCancelled { output_bytes } => output_bytes,
        };

        if let RecordingOutput::File { path } = &job.output {
            tokio::fs::write(path, vec![0u8; output_bytes]).await?;
        }

        let (tx, events) = mpsc::channel(8);
        match self.behavior {
            Behavior::ExitImmediately { code, .. } => {
                tokio::spawn(async move {
                    let _ = tx.send(EncoderEvent::Exited { code: Some(code) }).await;
                });
            }
            Behavior::RunUntilCancelled { .. } => {
                tokio::spawn(async move {
                    token.cancelled().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let _ = tx.send(EncoderEvent::Exited { code: Some(255) }).await;
                });
            }
            Behavior::FailSpawn => unreachable!(),
        }

        Ok(EncoderHandle { pid: Some(4242), events })
    }

    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        Some("scripted 1.0".to_string())
    }
}

struct Harness {
    pool: DbPool,
    history: Arc<dyn RecordingHistoryRepository>,
    manager: Arc<RecorderManager>,
    encoder: Arc<ScriptedEncoder>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    async fn new(behavior: Behavior) -> Self {
        Self::with_retry_delay(behavior, Duration::from_millis(50)).await
    }

    async fn with_retry_delay(behavior: Behavior, retry_delay: Duration) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let history: Arc<dyn RecordingHistoryRepository> =
            Arc::new(SqlxRecordingHistoryRepository::new(pool.clone()));
        let settings: Arc<dyn SettingsRepository> =
            Arc::new(SqlxSettingsRepository::new(pool.clone()));
        let journal = Arc::new(TerminalJournal::new(tmp.path().join("journal.jsonl")));
        let encoder = ScriptedEncoder::new(behavior);

        let manager = Arc::new(RecorderManager::new(
            RecorderConfig {
                recordings_root: tmp.path().join("recordings"),
                stall_timeout: Duration::from_secs(60),
                retry_delay,
                retry_cooldown: Duration::from_secs(60),
                max_recording_duration: Duration::from_secs(24 * 60 * 60),
            },
            encoder.clone(),
            DurableHistoryWriter::new(history.clone(), journal),
            settings,
        ));

        Self {
            pool,
            history,
            manager,
            encoder,
            _tmp: tmp,
        }
    }

    fn reconciler(&self) -> ReconciliationService {
        let schedules: Arc<dyn ScheduleRepository> =
            Arc::new(SqlxScheduleRepository::new(self.pool.clone()));
        ReconciliationService::new(
            schedules,
            self.history.clone(),
            self.manager.clone(),
            ReconcilerConfig::default(),
        )
    }

    async fn insert_schedule_row(&self, id: i64, camera: &str) {
        sqlx::query(
            r#"
            INSERT INTO schedules
                (id, camera_id, camera_name, days_of_week, start_time, end_time,
                 recording_type, is_active, source, bitrate_kbps)
            VALUES (?, 1, ?, '[0,1,2,3,4,5,6]', '00:00', '23:59', 'continuous', 1,
                    'rtsp://cam.local/main', 2000)
            "#,
        )
        .bind(id)
        .bind(camera)
        .execute(&self.pool)
        .await
        .unwrap();
    }

    async fn history_rows(&self) -> Vec<rust_nvr::database::models::RecordingHistoryDbModel> {
        self.history.query(&HistoryFilters::new()).await.unwrap()
    }

    /// Poll until the single history row reaches `status`.
    async fn wait_for_status(&self, status: RecordingStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let rows = self.history_rows().await;
            if rows.iter().any(|r| r.status() == Some(status)) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for status {status}, rows: {rows:?}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.manager.active_count() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for recordings to finalize"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn in_window_schedule(id: i64, camera: &str) -> Schedule {
    Schedule::new(
        id,
        1,
        camera,
        &[0, 1, 2, 3, 4, 5, 6],
        "00:00",
        "23:59",
        "continuous",
        true,
        "rtsp://cam.local/main",
        Some(2000),
    )
    .unwrap()
}

#[tokio::test]
async fn empty_output_recording_becomes_error_and_artifact_is_deleted() {
    let harness = Harness::new(Behavior::ExitImmediately {
        code: 0,
        output_bytes: 0,
    })
    .await;

    let schedule = in_window_schedule(1, "gate");
    assert!(harness.manager.start(&schedule).await.unwrap());

    harness.wait_for_status(RecordingStatus::Error).await;
    harness.wait_idle().await;

    let rows = harness.history_rows().await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].error_message.as_deref().unwrap().contains("empty output"));
    assert!(rows[0].end_time.is_some());

    // The zero-byte artifact and its sidecar are gone.
    let path = std::path::PathBuf::from(&rows[0].filename);
    assert!(!path.exists());
    assert!(!rust_nvr::domain::recording::sidecar_for(&path).exists());
}

#[tokio::test]
async fn stopped_recording_finalizes_with_end_time() {
    let harness = Harness::new(Behavior::RunUntilCancelled { output_bytes: 4096 }).await;

    let schedule = in_window_schedule(1, "gate");
    assert!(harness.manager.start(&schedule).await.unwrap());
    let key = RecordingKey::new("gate", 1);
    assert!(harness.manager.is_active(&key));
    assert!(harness.manager.is_recording("gate"));

    assert!(harness.manager.stop(&key, StopReason::ScheduleEnded));

    harness.wait_for_status(RecordingStatus::Stopped).await;
    harness.wait_idle().await;

    let rows = harness.history_rows().await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].end_time.is_some());
    assert!(rows[0].error_message.is_none());
    assert!(!harness.manager.is_recording("gate"));
}

#[tokio::test]
async fn concurrent_starts_launch_exactly_one_encoder() {
    let harness = Harness::new(Behavior::RunUntilCancelled { output_bytes: 1024 }).await;
    let schedule = in_window_schedule(1, "gate");
    let key = RecordingKey::new("gate", 1);

    let (a, b) = tokio::join!(
        harness.manager.start(&schedule),
        harness.manager.start(&schedule)
    );
    let started = [a.unwrap(), b.unwrap()];

    assert_eq!(started.iter().filter(|s| **s).count(), 1);
    assert_eq!(harness.manager.active_count(), 1);
    assert_eq!(harness.encoder.spawn_count(&key), 1);

    // A repeated start against a live recording is a no-op too.
    assert!(!harness.manager.start(&schedule).await.unwrap());
    assert_eq!(harness.encoder.spawn_count(&key), 1);
}

#[tokio::test]
async fn spawn_failure_marks_history_error_without_retry() {
    let harness = Harness::new(Behavior::FailSpawn).await;
    let schedule = in_window_schedule(1, "gate");

    let result = harness.manager.start(&schedule).await;
    assert!(result.is_err());
    assert_eq!(harness.manager.active_count(), 0);

    harness.wait_for_status(RecordingStatus::Error).await;
    let rows = harness.history_rows().await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].error_message.as_deref().unwrap().contains("spawn failed"));

    // No delayed restart for spawn failures.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.encoder.spawn_count(&RecordingKey::new("gate", 1)), 1);
}

#[tokio::test]
async fn transient_failure_retries_once_within_cooldown() {
    let harness = Harness::with_retry_delay(
        Behavior::ExitImmediately {
            code: 1,
            output_bytes: 2048,
        },
        Duration::from_millis(30),
    )
    .await;
    let schedule = in_window_schedule(1, "gate");
    let key = RecordingKey::new("gate", 1);

    assert!(harness.manager.start(&schedule).await.unwrap());

    // First attempt fails abnormally, earns one delayed restart; the second
    // failure lands inside the cooldown and is not retried again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.encoder.spawn_count(&key) < 2 {
        assert!(tokio::time::Instant::now() < deadline, "retry never happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    harness.wait_idle().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.encoder.spawn_count(&key), 2);

    let rows = harness.history_rows().await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status() == Some(RecordingStatus::Error)));
}

#[tokio::test]
async fn reconciliation_tick_is_idempotent() {
    let harness = Harness::new(Behavior::RunUntilCancelled { output_bytes: 1024 }).await;
    harness.insert_schedule_row(1, "gate").await;
    harness.insert_schedule_row(2, "lobby").await;
    let reconciler = harness.reconciler();

    let first = reconciler.tick().await.unwrap();
    assert_eq!(first, TickReport { started: 2, stopped: 0 });
    assert_eq!(harness.manager.active_count(), 2);

    // No external change: the second tick issues zero actions.
    let second = reconciler.tick().await.unwrap();
    assert_eq!(second, TickReport::default());
    assert_eq!(harness.manager.active_count(), 2);
}

#[tokio::test]
async fn completed_schedule_is_excluded_for_the_rest_of_the_day() {
    let harness = Harness::new(Behavior::ExitImmediately {
        code: 0,
        output_bytes: 4096,
    })
    .await;
    harness.insert_schedule_row(1, "gate").await;
    let reconciler = harness.reconciler();

    let first = reconciler.tick().await.unwrap();
    assert_eq!(first.started, 1);

    harness.wait_for_status(RecordingStatus::Completed).await;
    harness.wait_idle().await;

    // Still inside the window, but the daily policy excludes the key now.
    let second = reconciler.tick().await.unwrap();
    assert_eq!(second, TickReport::default());
    assert_eq!(harness.manager.active_count(), 0);
    assert_eq!(harness.encoder.spawn_count(&RecordingKey::new("gate", 1)), 1);
}

#[tokio::test]
async fn reconciliation_stops_recordings_no_longer_desired() {
    let harness = Harness::new(Behavior::RunUntilCancelled { output_bytes: 1024 }).await;
    harness.insert_schedule_row(1, "gate").await;
    let reconciler = harness.reconciler();

    assert_eq!(reconciler.tick().await.unwrap().started, 1);

    // Deactivate the schedule out from under the engine.
    sqlx::query("UPDATE schedules SET is_active = 0 WHERE id = 1")
        .execute(&harness.pool)
        .await
        .unwrap();

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.stopped, 1);

    harness.wait_for_status(RecordingStatus::Stopped).await;
    harness.wait_idle().await;
}

#[tokio::test]
async fn safety_sweep_force_stops_overlong_recordings() {
    let harness = Harness::new(Behavior::RunUntilCancelled { output_bytes: 1024 }).await;
    let schedule = in_window_schedule(1, "gate");
    assert!(harness.manager.start(&schedule).await.unwrap());

    // Zero ceiling: everything currently running is overlong.
    assert_eq!(harness.manager.stop_exceeding(Duration::ZERO), 1);

    harness.wait_for_status(RecordingStatus::Stopped).await;
    harness.wait_idle().await;
}

#[tokio::test]
async fn startup_recovery_finalizes_orphaned_rows() {
    let harness = Harness::new(Behavior::RunUntilCancelled { output_bytes: 1024 }).await;

    // Simulate a row left behind by a crashed daemon.
    let id = harness
        .history
        .append(&rust_nvr::database::models::NewRecordingHistory {
            schedule_id: 1,
            camera_id: 1,
            camera_name: "gate".into(),
            filename: "/rec/gate/old.mp4".into(),
            start_time: chrono::Utc::now() - chrono::Duration::hours(2),
        })
        .await
        .unwrap();

    let fixed = harness
        .history
        .finalize_all_recording(chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(fixed, 1);
    assert_eq!(
        harness.history.get(id).await.unwrap().status(),
        Some(RecordingStatus::Stopped)
    );
}
