//! Recording history models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// Lifecycle status of a recording attempt.
///
/// `Recording` is the only non-terminal state; a row transitions out of it
/// exactly once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Recording,
    Completed,
    Stopped,
    Error,
}

impl RecordingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Recording)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// Recording history database row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecordingHistoryDbModel {
    pub id: i64,
    pub schedule_id: i64,
    pub camera_id: i64,
    pub camera_name: String,
    pub filename: String,
    /// Epoch milliseconds (UTC).
    pub start_time: i64,
    /// Epoch milliseconds (UTC), set on the terminal transition.
    pub end_time: Option<i64>,
    pub status: String,
    pub error_message: Option<String>,
}

impl RecordingHistoryDbModel {
    pub fn status(&self) -> Option<RecordingStatus> {
        self.status.parse().ok()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        time::ms_to_datetime(self.start_time)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.end_time.map(time::ms_to_datetime)
    }
}

/// Fields for a new history row; the row is always born in `Recording`.
#[derive(Debug, Clone)]
pub struct NewRecordingHistory {
    pub schedule_id: i64,
    pub camera_id: i64,
    pub camera_name: String,
    pub filename: String,
    pub start_time: DateTime<Utc>,
}

/// Filter criteria for querying recording history.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilters {
    pub camera_name: Option<String>,
    pub schedule_id: Option<i64>,
    pub status: Option<RecordingStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera_name(mut self, camera_name: impl Into<String>) -> Self {
        self.camera_name = Some(camera_name.into());
        self
    }

    pub fn with_schedule_id(mut self, schedule_id: i64) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn with_status(mut self, status: RecordingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_range(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }
}
