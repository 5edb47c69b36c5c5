//! Repositories over the SQLite store.

pub mod history;
pub mod schedule;
pub mod settings;

pub use history::{DurableHistoryWriter, RecordingHistoryRepository, SqlxRecordingHistoryRepository};
pub use schedule::{ScheduleRepository, SqlxScheduleRepository};
pub use settings::{SettingsRepository, SqlxSettingsRepository};
