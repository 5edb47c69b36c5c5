//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).
//! Day-boundary helpers use local wall-clock days, matching how schedules
//! are evaluated.

use chrono::{DateTime, Local, TimeZone, Utc};

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => Utc::now(),
    }
}

/// `[start_of_day, end_of_day)` of the local calendar day containing `now`,
/// as epoch milliseconds.
pub fn local_day_bounds_ms(now: DateTime<Local>) -> (i64, i64) {
    let date = now.date_naive();
    let start = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time");
    let start_local = match Local.from_local_datetime(&start) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        // A DST gap at midnight: fall back to the earliest valid instant.
        chrono::LocalResult::None => now - chrono::Duration::hours(24),
    };
    let start_ms = start_local.timestamp_millis();
    (start_ms, start_ms + 24 * 60 * 60 * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ms_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2026, 8, 3, 12, 30, 0).unwrap();
        assert_eq!(ms_to_datetime(datetime_to_ms(dt)), dt);
    }

    #[test]
    fn test_local_day_bounds_contain_now() {
        let now = Local::now();
        let (start, end) = local_day_bounds_ms(now);
        let now_ms = now.timestamp_millis();
        assert!(start <= now_ms && now_ms < end);
        assert_eq!(end - start, 24 * 60 * 60 * 1000);
    }

    #[test]
    fn test_local_day_bounds_exclude_yesterday() {
        let now = Local::now();
        let (start, _) = local_day_bounds_ms(now);
        let yesterday = now - chrono::Duration::days(1);
        assert!(yesterday.timestamp_millis() < start);
    }
}
