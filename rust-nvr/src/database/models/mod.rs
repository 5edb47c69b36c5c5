//! Database row models.

pub mod history;
pub mod schedule;
pub mod settings;

pub use history::{HistoryFilters, NewRecordingHistory, RecordingHistoryDbModel, RecordingStatus};
pub use schedule::ScheduleDbModel;
pub use settings::RetentionSettings;
