//! Recording identity and output descriptors.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Composite identifier serializing access to a single recording slot.
///
/// At most one encoder process may run per key at any instant; the active
/// map keyed by `RecordingKey` is the serialization point for start/stop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordingKey {
    pub camera_name: String,
    pub schedule_id: i64,
}

impl RecordingKey {
    pub fn new(camera_name: impl Into<String>, schedule_id: i64) -> Self {
        Self {
            camera_name: camera_name.into(),
            schedule_id,
        }
    }
}

impl std::fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.camera_name, self.schedule_id)
    }
}

/// Where a recording writes its media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingOutput {
    /// A single container file.
    File { path: PathBuf },
    /// A directory of fixed-duration segments indexed by an M3U8 manifest.
    Segmented { dir: PathBuf, manifest: PathBuf },
}

impl RecordingOutput {
    /// The path recorded in history: the container file, or the manifest.
    pub fn primary_path(&self) -> &Path {
        match self {
            Self::File { path } => path,
            Self::Segmented { manifest, .. } => manifest,
        }
    }

    /// Sidecar metadata file written next to the output.
    pub fn sidecar_path(&self) -> PathBuf {
        sidecar_for(self.primary_path())
    }

    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::Segmented { .. })
    }
}

/// Sidecar metadata path for a media file (`foo.mp4` -> `foo.mp4.json`).
pub fn sidecar_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".json");
    path.with_file_name(name)
}
