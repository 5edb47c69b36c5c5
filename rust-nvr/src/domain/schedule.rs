//! Validated schedule types.

use chrono::{DateTime, Local, Timelike};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default video bitrate applied when a schedule row carries none.
pub const DEFAULT_BITRATE_KBPS: u32 = 2000;

/// Upper bound accepted for a schedule bitrate.
const MAX_BITRATE_KBPS: u32 = 50_000;

/// A wall-clock time of day with minute granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    /// Parse an "HH:MM" string.
    pub fn parse(s: &str) -> Result<Self> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| Error::validation(format!("invalid time of day: {s:?}")))?;
        let hour: u16 = h
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid hour in {s:?}")))?;
        let minute: u16 = m
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid minute in {s:?}")))?;
        if hour > 23 || minute > 59 {
            return Err(Error::validation(format!("time of day out of range: {s:?}")));
        }
        Ok(Self {
            minutes: hour * 60 + minute,
        })
    }

    /// Minute offset from midnight (0..=1439).
    pub fn minute_of_day(&self) -> u16 {
        self.minutes
    }

    /// The time of day of a local timestamp, truncated to the minute.
    pub fn from_datetime(dt: DateTime<Local>) -> Self {
        Self {
            minutes: (dt.hour() * 60 + dt.minute()) as u16,
        }
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

/// A set of weekdays, 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaySet(u8);

impl DaySet {
    /// Build a day set from weekday numbers, rejecting values outside 0..=6.
    pub fn from_days(days: &[u8]) -> Result<Self> {
        let mut mask = 0u8;
        for &day in days {
            if day > 6 {
                return Err(Error::validation(format!("invalid day of week: {day}")));
            }
            mask |= 1 << day;
        }
        Ok(Self(mask))
    }

    pub fn contains(&self, day: u8) -> bool {
        day <= 6 && self.0 & (1 << day) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn days(&self) -> Vec<u8> {
        (0..7).filter(|d| self.contains(*d)).collect()
    }
}

/// Output mode derived from a schedule's `recording_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// One container file per recording session.
    Single,
    /// Fixed-duration segments plus an M3U8 manifest.
    Segmented,
}

impl RecordingMode {
    /// Map a schedule row's `recording_type` string to a mode.
    ///
    /// Unknown values are rejected rather than guessed at.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" | "scheduled" | "video" | "mp4" => Ok(Self::Single),
            "hls" | "segment" | "segmented" => Ok(Self::Segmented),
            other => Err(Error::validation(format!(
                "unknown recording type: {other:?}"
            ))),
        }
    }
}

/// A validated recording schedule.
///
/// Owned by the CRUD layer; immutable from the engine's point of view for
/// the lifetime of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub camera_id: i64,
    pub camera_name: String,
    pub days_of_week: DaySet,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub mode: RecordingMode,
    pub is_active: bool,
    /// Encoder input descriptor (stream URI).
    pub source: String,
    pub bitrate_kbps: u32,
}

impl Schedule {
    /// Validate raw schedule fields into a domain schedule.
    ///
    /// A window spanning midnight must be expressed as two schedule rows, so
    /// `start_time < end_time` is required here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        camera_id: i64,
        camera_name: impl Into<String>,
        days: &[u8],
        start_time: &str,
        end_time: &str,
        recording_type: &str,
        is_active: bool,
        source: &str,
        bitrate_kbps: Option<u32>,
    ) -> Result<Self> {
        let camera_name = camera_name.into();
        if camera_name.trim().is_empty() {
            return Err(Error::validation("camera name must not be empty"));
        }

        let days_of_week = DaySet::from_days(days)?;
        if days_of_week.is_empty() {
            return Err(Error::validation("schedule has no days of week"));
        }

        let start_time = TimeOfDay::parse(start_time)?;
        let end_time = TimeOfDay::parse(end_time)?;
        if start_time >= end_time {
            return Err(Error::validation(format!(
                "schedule window {start_time}..{end_time} is empty or spans midnight"
            )));
        }

        let source = normalize_source(source)?;

        let bitrate_kbps = match bitrate_kbps {
            Some(0) | None => DEFAULT_BITRATE_KBPS,
            Some(b) if b > MAX_BITRATE_KBPS => {
                return Err(Error::validation(format!("bitrate out of range: {b} kbps")));
            }
            Some(b) => b,
        };

        Ok(Self {
            id,
            camera_id,
            camera_name,
            days_of_week,
            start_time,
            end_time,
            mode: RecordingMode::parse(recording_type)?,
            is_active,
            source,
            bitrate_kbps,
        })
    }

    /// Whether `now` falls inside `[start_time, end_time)` on an active day.
    pub fn is_in_window(&self, now: DateTime<Local>) -> bool {
        let day = chrono::Datelike::weekday(&now).num_days_from_sunday() as u8;
        if !self.days_of_week.contains(day) {
            return false;
        }
        let minute = TimeOfDay::from_datetime(now).minute_of_day();
        self.start_time.minute_of_day() <= minute && minute < self.end_time.minute_of_day()
    }

    /// Minutes until the window closes, zero if already past the end.
    pub fn minutes_until_window_end(&self, now: DateTime<Local>) -> u16 {
        let minute = TimeOfDay::from_datetime(now).minute_of_day();
        self.end_time.minute_of_day().saturating_sub(minute)
    }
}

/// Strip a leading `-i` flag that some upstream sources carry and reject
/// empty descriptors.
fn normalize_source(source: &str) -> Result<String> {
    let mut s = source.trim();
    if let Some(rest) = s.strip_prefix("-i") {
        s = rest.trim_start();
    }
    if s.is_empty() {
        return Err(Error::validation("schedule source must not be empty"));
    }
    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(days: &[u8], start: &str, end: &str) -> Schedule {
        Schedule::new(
            1,
            10,
            "front-gate",
            days,
            start,
            end,
            "continuous",
            true,
            "rtsp://cam.local/stream1",
            Some(2000),
        )
        .unwrap()
    }

    #[test]
    fn test_time_of_day_parse() {
        assert_eq!(TimeOfDay::parse("09:30").unwrap().minute_of_day(), 570);
        assert_eq!(TimeOfDay::parse("00:00").unwrap().minute_of_day(), 0);
        assert_eq!(TimeOfDay::parse("23:59").unwrap().minute_of_day(), 1439);
        assert!(TimeOfDay::parse("24:00").is_err());
        assert!(TimeOfDay::parse("12:60").is_err());
        assert!(TimeOfDay::parse("nine").is_err());
    }

    #[test]
    fn test_time_of_day_display_roundtrip() {
        let t = TimeOfDay::parse("07:05").unwrap();
        assert_eq!(t.to_string(), "07:05");
    }

    #[test]
    fn test_day_set_rejects_out_of_range() {
        assert!(DaySet::from_days(&[0, 6]).is_ok());
        assert!(DaySet::from_days(&[7]).is_err());
    }

    #[test]
    fn test_day_set_membership() {
        let days = DaySet::from_days(&[1, 3, 5]).unwrap();
        assert!(days.contains(1));
        assert!(!days.contains(0));
        assert_eq!(days.days(), vec![1, 3, 5]);
    }

    #[test]
    fn test_recording_mode_parse() {
        assert_eq!(RecordingMode::parse("continuous").unwrap(), RecordingMode::Single);
        assert_eq!(RecordingMode::parse("HLS").unwrap(), RecordingMode::Segmented);
        assert!(RecordingMode::parse("wavelet").is_err());
    }

    #[test]
    fn test_schedule_rejects_midnight_wrap() {
        let err = Schedule::new(
            1,
            10,
            "cam",
            &[1],
            "22:00",
            "02:00",
            "continuous",
            true,
            "rtsp://cam/1",
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_schedule_rejects_empty_window() {
        assert!(
            Schedule::new(1, 10, "cam", &[1], "09:00", "09:00", "continuous", true, "rtsp://c", None)
                .is_err()
        );
    }

    #[test]
    fn test_schedule_rejects_empty_days() {
        assert!(
            Schedule::new(1, 10, "cam", &[], "09:00", "10:00", "continuous", true, "rtsp://c", None)
                .is_err()
        );
    }

    #[test]
    fn test_source_normalization() {
        let s = Schedule::new(
            1,
            10,
            "cam",
            &[1],
            "09:00",
            "10:00",
            "continuous",
            true,
            "-i rtsp://cam.local/main",
            None,
        )
        .unwrap();
        assert_eq!(s.source, "rtsp://cam.local/main");
        assert_eq!(s.bitrate_kbps, DEFAULT_BITRATE_KBPS);
    }

    #[test]
    fn test_is_in_window() {
        // Monday 2026-08-03
        let s = schedule(&[1], "09:00", "10:00");
        let inside = Local.with_ymd_and_hms(2026, 8, 3, 9, 30, 0).unwrap();
        let after = Local.with_ymd_and_hms(2026, 8, 3, 10, 1, 0).unwrap();
        let at_end = Local.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap();
        let wrong_day = Local.with_ymd_and_hms(2026, 8, 4, 9, 30, 0).unwrap();

        assert!(s.is_in_window(inside));
        assert!(!s.is_in_window(after));
        // End boundary is exclusive.
        assert!(!s.is_in_window(at_end));
        assert!(!s.is_in_window(wrong_day));
    }

    #[test]
    fn test_minutes_until_window_end() {
        let s = schedule(&[1], "09:00", "10:00");
        let now = Local.with_ymd_and_hms(2026, 8, 3, 9, 30, 0).unwrap();
        assert_eq!(s.minutes_until_window_end(now), 30);
        let past = Local.with_ymd_and_hms(2026, 8, 3, 11, 0, 0).unwrap();
        assert_eq!(s.minutes_until_window_end(past), 0);
    }
}
