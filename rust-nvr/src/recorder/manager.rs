//! The recording lifecycle manager.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::encoder::{Encoder, EncoderEvent, EncoderJob, is_fatal_stderr, segment_file_prefix};
use super::retry::RetryTracker;
use super::watchdog;
use crate::database::models::{NewRecordingHistory, RecordingStatus};
use crate::database::repositories::{DurableHistoryWriter, SettingsRepository};
use crate::domain::{RecordingKey, RecordingMode, RecordingOutput, Schedule};
use crate::Result;
use crate::utils::filename::sanitize_camera_name;
use crate::utils::fs;

/// Configuration for the recorder manager.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Root directory for recorded media.
    pub recordings_root: PathBuf,
    /// Stderr silence beyond this is treated as a stalled encoder.
    pub stall_timeout: Duration,
    /// Delay before a transient-failure restart.
    pub retry_delay: Duration,
    /// Minimum spacing between restarts of the same key.
    pub retry_cooldown: Duration,
    /// Hard ceiling on a single recording's duration.
    pub max_recording_duration: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            recordings_root: PathBuf::from("./recordings"),
            stall_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            retry_cooldown: Duration::from_secs(60),
            max_recording_duration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Why a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    /// The reconciliation loop no longer wants this key recording.
    ScheduleEnded,
    /// The schedule-end watchdog fired.
    WindowClosed,
    /// The hourly sweep found the recording over the hard ceiling.
    DurationCeiling,
    /// Daemon shutdown.
    Shutdown,
}

/// Events broadcast by the manager.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    RecordingStarted {
        key: RecordingKey,
        history_id: i64,
        pid: Option<u32>,
    },
    RecordingCompleted {
        key: RecordingKey,
        history_id: i64,
        output: RecordingOutput,
    },
    RecordingStopped {
        key: RecordingKey,
        history_id: i64,
    },
    RecordingFailed {
        key: RecordingKey,
        history_id: i64,
        error: String,
    },
}

/// Internal state for one in-flight recording.
struct ActiveRecording {
    history_id: i64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    output: RecordingOutput,
    token: CancellationToken,
    has_error: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

/// Public view of an in-flight recording.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveRecordingInfo {
    pub key: RecordingKey,
    pub history_id: i64,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub output_path: PathBuf,
}

/// Owns the map of in-flight recordings and supervises one encoder process
/// per (camera, schedule) pair.
///
/// The map is the serialization point for the at-most-one-process-per-key
/// invariant: a key is reserved in the map before its process is spawned and
/// released only after the process exit is observed.
pub struct RecorderManager {
    config: RecorderConfig,
    encoder: Arc<dyn Encoder>,
    history: DurableHistoryWriter,
    settings: Arc<dyn SettingsRepository>,
    active: DashMap<RecordingKey, ActiveRecording>,
    retries: RetryTracker,
    events_tx: broadcast::Sender<RecorderEvent>,
}

impl RecorderManager {
    pub fn new(
        config: RecorderConfig,
        encoder: Arc<dyn Encoder>,
        history: DurableHistoryWriter,
        settings: Arc<dyn SettingsRepository>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let retries = RetryTracker::new(config.retry_cooldown);
        Self {
            config,
            encoder,
            history,
            settings,
            active: DashMap::new(),
            retries,
            events_tx,
        }
    }

    /// Subscribe to recorder events.
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events_tx.subscribe()
    }

    /// Start recording for a schedule.
    ///
    /// Idempotent: returns `Ok(false)` when the key is already busy. The
    /// history row is inserted in `recording` state before the encoder is
    /// launched; a spawn failure finalizes it as `error` with no retry.
    pub async fn start(self: &Arc<Self>, schedule: &Schedule) -> Result<bool> {
        let key = RecordingKey::new(&schedule.camera_name, schedule.id);

        let now = Utc::now();
        let now_local = Local::now();
        let dir = self
            .config
            .recordings_root
            .join(sanitize_camera_name(&schedule.camera_name))
            .join(now_local.format("%Y-%m-%d").to_string());
        let output = match schedule.mode {
            RecordingMode::Single => RecordingOutput::File {
                path: dir.join(format!("{}_{}.mp4", now.timestamp_millis(), schedule.id)),
            },
            RecordingMode::Segmented => RecordingOutput::Segmented {
                manifest: dir.join(format!("index_{}.m3u8", schedule.id)),
                dir: dir.clone(),
            },
        };

        let token = CancellationToken::new();
        let has_error = Arc::new(AtomicBool::new(false));
        let stop_requested = Arc::new(AtomicBool::new(false));

        // Reserve the key before any await so two concurrent starts cannot
        // both launch a process.
        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(key = %key, "Recording already in progress, skipping start");
                return Ok(false);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ActiveRecording {
                    history_id: 0,
                    pid: None,
                    started_at: now,
                    started_instant: Instant::now(),
                    output: output.clone(),
                    token: token.clone(),
                    has_error: has_error.clone(),
                    stop_requested: stop_requested.clone(),
                });
            }
        }

        match self
            .launch(schedule, &key, output, now, token, has_error, stop_requested)
            .await
        {
            Ok(history_id) => {
                info!(key = %key, history_id, "Started recording");
                Ok(true)
            }
            Err(e) => {
                self.active.remove(&key);
                Err(e)
            }
        }
    }

    /// The fallible part of `start`; the caller releases the reservation on
    /// failure.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        self: &Arc<Self>,
        schedule: &Schedule,
        key: &RecordingKey,
        output: RecordingOutput,
        now: DateTime<Utc>,
        token: CancellationToken,
        has_error: Arc<AtomicBool>,
        stop_requested: Arc<AtomicBool>,
    ) -> Result<i64> {
        match &output {
            RecordingOutput::File { path } => {
                if let Some(parent) = path.parent() {
                    fs::ensure_dir_all(parent).await?;
                }
            }
            RecordingOutput::Segmented { dir, .. } => fs::ensure_dir_all(dir).await?,
        }

        let filename = output.primary_path().to_string_lossy().into_owned();

        // Self-healing: any row still `recording` for this key (or claiming
        // our output file) belongs to a process that no longer exists.
        self.history
            .repository()
            .finalize_stale(key, &filename, now)
            .await?;

        let history_id = self
            .history
            .repository()
            .append(&NewRecordingHistory {
                schedule_id: schedule.id,
                camera_id: schedule.camera_id,
                camera_name: schedule.camera_name.clone(),
                filename,
                start_time: now,
            })
            .await?;

        let segment_duration_secs = match self.settings.load_retention().await {
            Ok(settings) => settings.segment_duration_secs,
            Err(e) => {
                warn!(error = %e, "Failed to load settings, using default segment duration");
                crate::database::models::RetentionSettings::default().segment_duration_secs
            }
        };

        let job = EncoderJob {
            key: key.clone(),
            source: schedule.source.clone(),
            bitrate_kbps: schedule.bitrate_kbps,
            segment_duration_secs,
            output: output.clone(),
        };

        let handle = match self.encoder.start(&job, token.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(key = %key, error = %e, "Encoder spawn failed");
                self.history
                    .mark_terminal(
                        history_id,
                        RecordingStatus::Error,
                        Utc::now(),
                        Some(&format!("encoder spawn failed: {e}")),
                    )
                    .await;
                return Err(e);
            }
        };

        if let Some(mut entry) = self.active.get_mut(key) {
            entry.history_id = history_id;
            entry.pid = handle.pid;
        }

        self.write_sidecar(schedule, &output, now).await;

        let _ = self.events_tx.send(RecorderEvent::RecordingStarted {
            key: key.clone(),
            history_id,
            pid: handle.pid,
        });

        // Schedule-end watchdog, bounded by the hard ceiling.
        let window_remaining =
            Duration::from_secs(u64::from(schedule.minutes_until_window_end(Local::now())) * 60);
        let deadline = window_remaining.min(self.config.max_recording_duration);
        watchdog::spawn_deferred_stop(
            self.clone(),
            key.clone(),
            token.clone(),
            deadline,
            StopReason::WindowClosed,
        );

        self.spawn_monitor(
            key.clone(),
            history_id,
            schedule.clone(),
            output,
            handle.events,
            token,
            has_error,
            stop_requested,
        );

        Ok(history_id)
    }

    /// Request a stop for a key. Non-blocking: the termination signal is
    /// issued here, escalation and history finalization happen on the
    /// monitor task. Returns `false` when the key is not recording.
    pub fn stop(&self, key: &RecordingKey, reason: StopReason) -> bool {
        let Some(entry) = self.active.get(key) else {
            return false;
        };
        entry.stop_requested.store(true, Ordering::SeqCst);
        entry.token.cancel();
        info!(key = %key, %reason, "Stop requested");
        true
    }

    /// Force-stop every recording older than `max_duration`. Safety net
    /// against stuck reconciliation.
    pub fn stop_exceeding(&self, max_duration: Duration) -> usize {
        let over: Vec<RecordingKey> = self
            .active
            .iter()
            .filter(|entry| entry.started_instant.elapsed() > max_duration)
            .map(|entry| entry.key().clone())
            .collect();

        let mut stopped = 0;
        for key in over {
            warn!(key = %key, "Recording exceeded hard ceiling");
            if self.stop(&key, StopReason::DurationCeiling) {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop everything (shutdown path).
    pub fn stop_all(&self) -> usize {
        let keys: Vec<RecordingKey> = self.active.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for key in keys {
            if self.stop(&key, StopReason::Shutdown) {
                stopped += 1;
            }
        }
        stopped
    }

    /// Wait until all recordings have finalized, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.active.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.active.is_empty() {
            warn!(
                remaining = self.active.len(),
                "Recordings still active after shutdown grace"
            );
        }
    }

    pub fn is_active(&self, key: &RecordingKey) -> bool {
        self.active.contains_key(key)
    }

    /// Whether any schedule is currently recording this camera.
    pub fn is_recording(&self, camera_name: &str) -> bool {
        self.active
            .iter()
            .any(|entry| entry.key().camera_name == camera_name)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_recordings(&self) -> Vec<ActiveRecordingInfo> {
        self.active
            .iter()
            .map(|entry| ActiveRecordingInfo {
                key: entry.key().clone(),
                history_id: entry.history_id,
                pid: entry.pid,
                started_at: entry.started_at,
                output_path: entry.output.primary_path().to_path_buf(),
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_monitor(
        self: &Arc<Self>,
        key: RecordingKey,
        history_id: i64,
        schedule: Schedule,
        output: RecordingOutput,
        mut events: mpsc::Receiver<EncoderEvent>,
        token: CancellationToken,
        has_error: Arc<AtomicBool>,
        stop_requested: Arc<AtomicBool>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut exit_code: Option<i32> = None;
            let mut last_error_line: Option<String> = None;

            loop {
                match tokio::time::timeout(manager.config.stall_timeout, events.recv()).await {
                    Ok(Some(EncoderEvent::Stderr(line))) => {
                        if is_fatal_stderr(&line) {
                            has_error.store(true, Ordering::SeqCst);
                            error!(key = %key, line = %line, "Fatal encoder error");
                            last_error_line = Some(line);
                        } else {
                            trace!(key = %key, line = %line, "encoder");
                        }
                    }
                    Ok(Some(EncoderEvent::Exited { code })) => {
                        exit_code = code;
                        break;
                    }
                    Ok(None) => {
                        warn!(key = %key, "Encoder event channel closed without exit event");
                        break;
                    }
                    Err(_) => {
                        if token.is_cancelled() {
                            // Already stopping; keep waiting for the exit.
                            continue;
                        }
                        warn!(
                            key = %key,
                            timeout = ?manager.config.stall_timeout,
                            "No encoder output, treating as stalled"
                        );
                        token.cancel();
                    }
                }
            }

            manager
                .finalize(
                    key,
                    history_id,
                    schedule,
                    output,
                    token,
                    has_error,
                    stop_requested,
                    exit_code,
                    last_error_line,
                )
                .await;
        });
    }

    /// Classify an exited recording, persist its terminal state, and release
    /// the key.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        self: &Arc<Self>,
        key: RecordingKey,
        history_id: i64,
        schedule: Schedule,
        output: RecordingOutput,
        token: CancellationToken,
        has_error: Arc<AtomicBool>,
        stop_requested: Arc<AtomicBool>,
        exit_code: Option<i32>,
        last_error_line: Option<String>,
    ) {
        self.active.remove(&key);
        // Releases the watchdog if it has not fired.
        token.cancel();

        let end_time = Utc::now();
        let fatal = has_error.load(Ordering::SeqCst);
        let stopped = stop_requested.load(Ordering::SeqCst);
        let output_bytes = output_size(&output, schedule.id).await;

        let (status, error_message) = if stopped {
            if fatal {
                (
                    RecordingStatus::Error,
                    Some(last_error_line.unwrap_or_else(|| "fatal encoder error".into())),
                )
            } else {
                (RecordingStatus::Stopped, None)
            }
        } else if output_bytes == 0 {
            delete_artifacts(&output, schedule.id).await;
            (
                RecordingStatus::Error,
                Some("encoder produced empty output".to_string()),
            )
        } else if fatal {
            (
                RecordingStatus::Error,
                Some(last_error_line.unwrap_or_else(|| "fatal encoder error".into())),
            )
        } else if exit_code == Some(0) {
            (RecordingStatus::Completed, None)
        } else {
            (
                RecordingStatus::Error,
                Some(format!("encoder exited abnormally (code {exit_code:?})")),
            )
        };

        self.history
            .mark_terminal(history_id, status, end_time, error_message.as_deref())
            .await;
        self.update_sidecar(&output, status, end_time).await;

        info!(key = %key, %status, output_bytes, ?exit_code, "Recording finalized");

        match status {
            RecordingStatus::Completed => {
                self.retries.clear(&key);
                let _ = self.events_tx.send(RecorderEvent::RecordingCompleted {
                    key,
                    history_id,
                    output,
                });
            }
            RecordingStatus::Stopped => {
                let _ = self
                    .events_tx
                    .send(RecorderEvent::RecordingStopped { key, history_id });
            }
            RecordingStatus::Error => {
                let _ = self.events_tx.send(RecorderEvent::RecordingFailed {
                    key: key.clone(),
                    history_id,
                    error: error_message.unwrap_or_default(),
                });

                // Bounded retry for transient failures: abnormal exit with
                // output and no fatal pattern, and not an operator stop.
                let transient = !stopped && !fatal && output_bytes > 0 && exit_code != Some(0);
                if transient {
                    if self.retries.try_retry(&key) {
                        info!(key = %key, delay = ?self.config.retry_delay, "Scheduling restart");
                        let manager = self.clone();
                        let delay = self.config.retry_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(e) = manager.start(&schedule).await {
                                warn!(key = %RecordingKey::new(&schedule.camera_name, schedule.id), error = %e, "Restart failed");
                            }
                        });
                    } else {
                        warn!(key = %key, "Retry cooldown active, not restarting");
                    }
                }
            }
            RecordingStatus::Recording => unreachable!("finalize only writes terminal states"),
        }
    }

    /// Write the sidecar metadata file. Failures are logged, never fatal.
    async fn write_sidecar(&self, schedule: &Schedule, output: &RecordingOutput, now: DateTime<Utc>) {
        let metadata = json!({
            "schedule_id": schedule.id,
            "camera_name": schedule.camera_name,
            "source": schedule.source,
            "start_time": now.to_rfc3339(),
            "output": output.primary_path().to_string_lossy(),
        });
        let path = output.sidecar_path();
        if let Err(e) = tokio::fs::write(&path, metadata.to_string()).await {
            warn!(path = %path.display(), error = %e, "Failed to write recording metadata");
        }
    }

    /// Record the terminal outcome in the sidecar metadata file.
    async fn update_sidecar(
        &self,
        output: &RecordingOutput,
        status: RecordingStatus,
        end_time: DateTime<Utc>,
    ) {
        let path = output.sidecar_path();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(_) => return,
        };
        let mut value: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unparseable recording metadata");
                return;
            }
        };
        if let Some(map) = value.as_object_mut() {
            map.insert("end_time".into(), json!(end_time.to_rfc3339()));
            map.insert("status".into(), json!(status.as_str()));
        }
        if let Err(e) = tokio::fs::write(&path, value.to_string()).await {
            warn!(path = %path.display(), error = %e, "Failed to update recording metadata");
        }
    }
}

/// Total bytes the encoder wrote for this output.
async fn output_size(output: &RecordingOutput, schedule_id: i64) -> u64 {
    match output {
        RecordingOutput::File { path } => tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .unwrap_or(0),
        RecordingOutput::Segmented { dir, .. } => {
            let prefix = segment_file_prefix(schedule_id);
            let mut total = 0u64;
            if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name();
                    if name.to_string_lossy().starts_with(&prefix) {
                        if let Ok(metadata) = entry.metadata().await {
                            total += metadata.len();
                        }
                    }
                }
            }
            total
        }
    }
}

/// Delete the artifacts of an empty recording.
async fn delete_artifacts(output: &RecordingOutput, schedule_id: i64) {
    let _ = fs::remove_file_if_exists(&output.sidecar_path()).await;
    match output {
        RecordingOutput::File { path } => {
            if let Err(e) = fs::remove_file_if_exists(path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete empty recording");
            }
        }
        RecordingOutput::Segmented { dir, manifest } => {
            let _ = fs::remove_file_if_exists(manifest).await;
            let prefix = segment_file_prefix(schedule_id);
            if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if entry.file_name().to_string_lossy().starts_with(&prefix) {
                        let _ = fs::remove_file_if_exists(&entry.path()).await;
                    }
                }
            }
        }
    }
}
