//! Storage reclamation.
//!
//! Two independent responsibilities:
//! - an age-based purge walking the recording root on a daily timer,
//! - a count-based segment trim applied after each segmented session ends.
//!
//! Retention settings are re-read from the settings record on every cycle,
//! never cached. Per-item filesystem failures are logged and skipped; they
//! are never fatal to a sweep.

pub mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::models::RetentionSettings;
use crate::database::repositories::SettingsRepository;
use crate::domain::recording::sidecar_for;
use crate::domain::RecordingOutput;
use crate::recorder::RecorderEvent;
use crate::utils::fs::remove_file_if_exists;
use manifest::SegmentManifest;

/// Media file extensions subject to the age purge.
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "ts"];

/// Configuration for the retention service.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub recordings_root: PathBuf,
    /// Interval between age purges.
    pub purge_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            recordings_root: PathBuf::from("./recordings"),
            purge_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Results of one age purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub deleted_files: usize,
    pub removed_dirs: usize,
    pub skipped: usize,
}

/// Results of one segment trim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimStats {
    pub removed_segments: usize,
    pub remaining_segments: usize,
}

/// Filesystem janitor for recorded media.
pub struct RetentionService {
    config: RetentionConfig,
    settings: Arc<dyn SettingsRepository>,
}

impl RetentionService {
    pub fn new(config: RetentionConfig, settings: Arc<dyn SettingsRepository>) -> Self {
        Self { config, settings }
    }

    /// Run until cancelled: periodic age purges, plus a segment trim after
    /// every completed segmented session.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<RecorderEvent>,
        token: CancellationToken,
    ) {
        info!(interval = ?self.config.purge_interval, "Retention service started");
        let mut interval = tokio::time::interval(self.config.purge_interval);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    match self.purge_cycle().await {
                        Ok(stats) => info!(
                            deleted = stats.deleted_files,
                            removed_dirs = stats.removed_dirs,
                            skipped = stats.skipped,
                            "Age purge completed"
                        ),
                        Err(e) => warn!(error = %e, "Age purge failed"),
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Ok(RecorderEvent::RecordingCompleted {
                            output: RecordingOutput::Segmented { manifest, .. },
                            key,
                            ..
                        }) => {
                            match self.trim_session(&manifest).await {
                                Ok(stats) if stats.removed_segments > 0 => info!(
                                    key = %key,
                                    removed = stats.removed_segments,
                                    remaining = stats.remaining_segments,
                                    "Trimmed segment overflow"
                                ),
                                Ok(_) => {}
                                Err(e) => warn!(key = %key, error = %e, "Segment trim failed"),
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Retention lagged behind recorder events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            events_open = false;
                        }
                    }
                }
            }
        }

        info!("Retention service stopped");
    }

    /// One age purge using the currently configured retention window.
    pub async fn purge_cycle(&self) -> Result<PurgeStats> {
        let settings = self.load_settings().await;
        let cutoff = SystemTime::now() - Duration::from_secs(u64::from(settings.retention_days) * 86_400);
        let root = self.config.recordings_root.clone();

        debug!(
            retention_days = settings.retention_days,
            root = %root.display(),
            "Starting age purge"
        );

        let stats = tokio::task::spawn_blocking(move || purge_dir(&root, cutoff, false))
            .await
            .map_err(|e| crate::Error::Other(format!("purge task panicked: {e}")))?;
        Ok(stats)
    }

    /// Trim a session's manifest down to the configured segment cap,
    /// deleting the oldest segment files first.
    pub async fn trim_session(&self, manifest_path: &Path) -> Result<TrimStats> {
        let settings = self.load_settings().await;
        trim_manifest(manifest_path, settings.max_segments as usize).await
    }

    async fn load_settings(&self) -> RetentionSettings {
        match self.settings.load_retention().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to load retention settings, using defaults");
                RetentionSettings::default()
            }
        }
    }
}

/// Recursively delete expired media files (and their sidecars) under `dir`,
/// removing directories left empty. Never deletes `dir` itself unless
/// `remove_self` is set by the recursion.
fn purge_dir(dir: &Path, cutoff: SystemTime, remove_self: bool) -> PurgeStats {
    let mut stats = PurgeStats::default();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                stats.skipped += 1;
            }
            return stats;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else {
            stats.skipped += 1;
            continue;
        };
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            stats.skipped += 1;
            continue;
        };

        if file_type.is_dir() {
            let sub = purge_dir(&path, cutoff, true);
            stats.deleted_files += sub.deleted_files;
            stats.removed_dirs += sub.removed_dirs;
            stats.skipped += sub.skipped;
        } else if is_media_file(&path) && is_expired(&path, cutoff) {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    stats.deleted_files += 1;
                    debug!(path = %path.display(), "Deleted expired recording");
                    let sidecar = sidecar_for(&path);
                    if sidecar.exists() && std::fs::remove_file(&sidecar).is_err() {
                        stats.skipped += 1;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete expired file");
                    stats.skipped += 1;
                }
            }
        }
    }

    if remove_self {
        if let Ok(mut remaining) = std::fs::read_dir(dir) {
            if remaining.next().is_none() && std::fs::remove_dir(dir).is_ok() {
                stats.removed_dirs += 1;
                debug!(dir = %dir.display(), "Removed empty directory");
            }
        }
    }

    stats
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_expired(path: &Path, cutoff: SystemTime) -> bool {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified < cutoff,
        Err(_) => false,
    }
}

/// Trim `manifest_path` to at most `max_segments` entries, deleting the
/// excess segment files oldest-first and rewriting the manifest without
/// dangling references.
async fn trim_manifest(manifest_path: &Path, max_segments: usize) -> Result<TrimStats> {
    let mut manifest = SegmentManifest::load(manifest_path).await?;
    if manifest.len() <= max_segments {
        return Ok(TrimStats {
            removed_segments: 0,
            remaining_segments: manifest.len(),
        });
    }

    let excess = manifest.len() - max_segments;
    let removed = manifest.trim_oldest(excess);
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    for uri in &removed {
        let segment_path = base.join(uri);
        if let Err(e) = remove_file_if_exists(&segment_path).await {
            warn!(path = %segment_path.display(), error = %e, "Failed to delete trimmed segment");
        }
        let _ = remove_file_if_exists(&sidecar_for(&segment_path)).await;
    }

    manifest.save(manifest_path).await?;

    Ok(TrimStats {
        removed_segments: removed.len(),
        remaining_segments: manifest.len(),
    })
}
