//! Schedule database row, owned by the CRUD layer.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;
use crate::domain::Schedule;

/// Raw schedule row as persisted by the CRUD layer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduleDbModel {
    pub id: i64,
    pub camera_id: i64,
    pub camera_name: String,
    /// JSON array of weekday numbers, 0 = Sunday .. 6 = Saturday.
    pub days_of_week: String,
    pub start_time: String,
    pub end_time: String,
    pub recording_type: String,
    pub is_active: bool,
    pub source: String,
    pub bitrate_kbps: i64,
}

impl ScheduleDbModel {
    /// Validate this row into a domain schedule.
    pub fn into_domain(self) -> Result<Schedule> {
        let days: Vec<u8> = serde_json::from_str(&self.days_of_week)?;
        let bitrate = u32::try_from(self.bitrate_kbps).ok();
        Schedule::new(
            self.id,
            self.camera_id,
            self.camera_name,
            &days,
            &self.start_time,
            &self.end_time,
            &self.recording_type,
            self.is_active,
            &self.source,
            bitrate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ScheduleDbModel {
        ScheduleDbModel {
            id: 3,
            camera_id: 11,
            camera_name: "lobby".into(),
            days_of_week: "[1,2,3,4,5]".into(),
            start_time: "08:00".into(),
            end_time: "18:00".into(),
            recording_type: "continuous".into(),
            is_active: true,
            source: "rtsp://lobby.local/main".into(),
            bitrate_kbps: 2500,
        }
    }

    #[test]
    fn test_into_domain() {
        let schedule = row().into_domain().unwrap();
        assert_eq!(schedule.id, 3);
        assert_eq!(schedule.days_of_week.days(), vec![1, 2, 3, 4, 5]);
        assert_eq!(schedule.bitrate_kbps, 2500);
    }

    #[test]
    fn test_into_domain_rejects_bad_days_json() {
        let mut r = row();
        r.days_of_week = "[1,9]".into();
        assert!(r.into_domain().is_err());
    }
}
