//! Service container for dependency injection.
//!
//! Builds the repository/manager/loop graph from an [`AppConfig`] and
//! manages startup recovery and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::AppConfig;
use crate::database::journal::TerminalJournal;
use crate::database::repositories::{
    DurableHistoryWriter, RecordingHistoryRepository, ScheduleRepository, SettingsRepository,
    SqlxRecordingHistoryRepository, SqlxScheduleRepository, SqlxSettingsRepository,
};
use crate::database::{self, DbPool};
use crate::recorder::{
    Encoder, FfmpegEncoder, FfmpegEncoderConfig, RecorderConfig, RecorderManager,
};
use crate::retention::{RetentionConfig, RetentionService};
use crate::scheduler::{ReconcilerConfig, ReconciliationService};

/// Time allowed for in-flight recordings to finalize on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Holds every long-lived service of the daemon.
pub struct ServiceContainer {
    pub pool: DbPool,
    pub history: Arc<dyn RecordingHistoryRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub journal: Arc<TerminalJournal>,
    pub recorder: Arc<RecorderManager>,
    pub reconciler: Arc<ReconciliationService>,
    pub retention: Arc<RetentionService>,
    shutdown: CancellationToken,
}

impl ServiceContainer {
    /// Build the full service graph and run startup recovery.
    pub async fn new(config: &AppConfig) -> Result<Self> {
        info!("Initializing service container");

        let pool = database::init_pool(&config.database_url).await?;
        database::run_migrations(&pool).await?;

        let history: Arc<dyn RecordingHistoryRepository> =
            Arc::new(SqlxRecordingHistoryRepository::new(pool.clone()));
        let schedules: Arc<dyn ScheduleRepository> =
            Arc::new(SqlxScheduleRepository::new(pool.clone()));
        let settings: Arc<dyn SettingsRepository> =
            Arc::new(SqlxSettingsRepository::new(pool.clone()));
        let journal = Arc::new(TerminalJournal::new(&config.journal_path));

        // Crash recovery: apply journaled terminal writes, then finalize any
        // rows still claiming to record. Those processes died with the
        // previous daemon run.
        let replayed = journal.replay(history.as_ref()).await?;
        if replayed > 0 {
            info!(replayed, "Applied journaled terminal writes");
        }
        let orphaned = history.finalize_all_recording(Utc::now()).await?;
        if orphaned > 0 {
            info!(orphaned, "Finalized orphaned recording rows from previous run");
        }

        let encoder: Arc<dyn Encoder> = Arc::new(FfmpegEncoder::with_config(FfmpegEncoderConfig {
            binary_path: config.ffmpeg_path.clone(),
            grace_period: config.grace_period,
        }));
        match encoder.version() {
            Some(version) => info!(%version, "Encoder available"),
            None => warn!(
                path = %config.ffmpeg_path,
                "Encoder binary not found; recordings will fail until it is installed"
            ),
        }

        let writer = DurableHistoryWriter::new(history.clone(), journal.clone());
        let recorder = Arc::new(RecorderManager::new(
            RecorderConfig {
                recordings_root: config.recordings_root.clone(),
                stall_timeout: config.stall_timeout,
                retry_delay: config.retry_delay,
                retry_cooldown: config.retry_cooldown,
                max_recording_duration: config.max_recording_duration,
            },
            encoder,
            writer,
            settings.clone(),
        ));

        let reconciler = Arc::new(ReconciliationService::new(
            schedules.clone(),
            history.clone(),
            recorder.clone(),
            ReconcilerConfig {
                tick_interval: config.tick_interval,
                sweep_interval: config.sweep_interval,
                max_recording_duration: config.max_recording_duration,
            },
        ));

        let retention = Arc::new(RetentionService::new(
            RetentionConfig {
                recordings_root: config.recordings_root.clone(),
                purge_interval: config.purge_interval,
            },
            settings.clone(),
        ));

        Ok(Self {
            pool,
            history,
            schedules,
            settings,
            journal,
            recorder,
            reconciler,
            retention,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the long-running loops.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let reconciler = self.reconciler.clone();
        let reconciler_task = tokio::spawn(reconciler.run(self.shutdown.child_token()));

        let retention = self.retention.clone();
        let retention_events = self.recorder.subscribe();
        let retention_task =
            tokio::spawn(retention.run(retention_events, self.shutdown.child_token()));

        vec![reconciler_task, retention_task]
    }

    /// Stop the loops and give in-flight recordings time to finalize.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown.cancel();
        let stopping = self.recorder.stop_all();
        if stopping > 0 {
            info!(stopping, "Waiting for recordings to finalize");
        }
        self.recorder.wait_idle(SHUTDOWN_GRACE).await;
        info!("Shutdown complete");
    }
}
