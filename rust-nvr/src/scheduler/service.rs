//! The reconciliation loop.
//!
//! A single periodic driver compares the desired recording set against the
//! active map and issues corrective start/stop commands. Runs are strictly
//! sequential; within a run, stops are evaluated before starts so a key
//! leaving and re-entering the desired set in one tick can never
//! double-record. A coarser hourly sweep force-stops anything over the hard
//! duration ceiling regardless of schedule state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::repositories::{RecordingHistoryRepository, ScheduleRepository};
use crate::domain::RecordingKey;
use crate::recorder::{RecorderManager, StopReason};
use crate::scheduler::evaluator;

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Reconciliation tick interval.
    pub tick_interval: Duration,
    /// Safety sweep interval.
    pub sweep_interval: Duration,
    /// Hard ceiling enforced by the sweep.
    pub max_recording_duration: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60 * 60),
            max_recording_duration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Actions taken by one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub stopped: usize,
}

/// Periodic driver reconciling desired vs. actual recording state.
pub struct ReconciliationService {
    schedules: Arc<dyn ScheduleRepository>,
    history: Arc<dyn RecordingHistoryRepository>,
    manager: Arc<RecorderManager>,
    config: ReconcilerConfig,
}

impl ReconciliationService {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        history: Arc<dyn RecordingHistoryRepository>,
        manager: Arc<RecorderManager>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            schedules,
            history,
            manager,
            config,
        }
    }

    /// Run the loop until the token is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            tick = ?self.config.tick_interval,
            sweep = ?self.config.sweep_interval,
            "Reconciliation loop started"
        );

        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Reconciliation tick failed");
                    }
                }
                _ = sweep.tick() => {
                    let stopped = self.manager.stop_exceeding(self.config.max_recording_duration);
                    if stopped > 0 {
                        warn!(stopped, "Safety sweep force-stopped overlong recordings");
                    }
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    /// One reconciliation run: compute the desired set, stop what should not
    /// be recording, start what should be. Idempotent: a second run with no
    /// external change issues no actions.
    pub async fn tick(&self) -> Result<TickReport> {
        let schedules = self.schedules.list_active().await?;
        let now = Local::now();
        let terminal_today = self.history.terminal_keys_today(now).await?;

        let desired = evaluator::desired_schedules(&schedules, now, &terminal_today);
        let desired_keys: HashSet<RecordingKey> = desired
            .iter()
            .map(|s| RecordingKey::new(&s.camera_name, s.id))
            .collect();

        let mut report = TickReport::default();

        // Stops before starts.
        for info in self.manager.active_recordings() {
            if !desired_keys.contains(&info.key) {
                debug!(key = %info.key, "Schedule no longer active, stopping");
                if self.manager.stop(&info.key, StopReason::ScheduleEnded) {
                    report.stopped += 1;
                }
            }
        }

        for schedule in desired {
            let key = RecordingKey::new(&schedule.camera_name, schedule.id);
            if self.manager.is_active(&key) {
                continue;
            }

            // Re-check history between evaluation and action: the recording
            // may have reached a terminal state while this tick was running.
            if self.history.has_terminal_today(&key, now).await? {
                debug!(key = %key, "Already finished today, not starting");
                continue;
            }

            match self.manager.start(schedule).await {
                Ok(true) => report.started += 1,
                Ok(false) => {}
                Err(e) => {
                    // One camera's failure never aborts the run.
                    warn!(key = %key, error = %e, "Failed to start recording");
                }
            }
        }

        if report != TickReport::default() {
            info!(
                started = report.started,
                stopped = report.stopped,
                active = self.manager.active_count(),
                "Reconciliation actions issued"
            );
        }

        Ok(report)
    }
}
