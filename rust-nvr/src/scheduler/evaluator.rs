//! Pure computation of "which schedules should be recording right now".

use std::collections::HashSet;

use chrono::{DateTime, Local};

use crate::domain::{RecordingKey, Schedule};

/// The subset of `schedules` that should currently be recording.
///
/// A schedule qualifies iff it is active, today is one of its days, the
/// current minute lies in `[start_time, end_time)`, and its key has not
/// already reached `completed` or `stopped` today. The last condition is
/// the one-completed-recording-per-schedule-per-day product policy: a
/// schedule does not resume after finishing or being stopped within the
/// same calendar day, even inside its window.
pub fn desired_schedules<'a>(
    schedules: &'a [Schedule],
    now: DateTime<Local>,
    terminal_today: &HashSet<RecordingKey>,
) -> Vec<&'a Schedule> {
    schedules
        .iter()
        .filter(|schedule| {
            schedule.is_active
                && schedule.is_in_window(now)
                && !terminal_today
                    .contains(&RecordingKey::new(&schedule.camera_name, schedule.id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(id: i64, camera: &str, days: &[u8], start: &str, end: &str) -> Schedule {
        Schedule::new(
            id,
            1,
            camera,
            days,
            start,
            end,
            "continuous",
            true,
            "rtsp://cam/main",
            None,
        )
        .unwrap()
    }

    // 2026-08-03 is a Monday.
    fn monday(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 3, h, m, 0).unwrap()
    }

    #[test]
    fn test_in_window_schedule_included() {
        let schedules = vec![schedule(1, "cam", &[1], "09:00", "10:00")];
        let desired = desired_schedules(&schedules, monday(9, 30), &HashSet::new());
        assert_eq!(desired.len(), 1);
    }

    #[test]
    fn test_after_window_excluded() {
        let schedules = vec![schedule(1, "cam", &[1], "09:00", "10:00")];
        assert!(desired_schedules(&schedules, monday(10, 1), &HashSet::new()).is_empty());
    }

    #[test]
    fn test_window_start_inclusive_end_exclusive() {
        let schedules = vec![schedule(1, "cam", &[1], "09:00", "10:00")];
        assert_eq!(
            desired_schedules(&schedules, monday(9, 0), &HashSet::new()).len(),
            1
        );
        assert!(desired_schedules(&schedules, monday(10, 0), &HashSet::new()).is_empty());
    }

    #[test]
    fn test_wrong_day_excluded() {
        // Sunday-only schedule on a Monday.
        let schedules = vec![schedule(1, "cam", &[0], "09:00", "10:00")];
        assert!(desired_schedules(&schedules, monday(9, 30), &HashSet::new()).is_empty());
    }

    #[test]
    fn test_inactive_excluded() {
        let mut inactive = schedule(1, "cam", &[1], "09:00", "10:00");
        inactive.is_active = false;
        let schedules = vec![inactive];
        assert!(desired_schedules(&schedules, monday(9, 30), &HashSet::new()).is_empty());
    }

    #[test]
    fn test_terminal_today_excluded_for_rest_of_day() {
        let schedules = vec![
            schedule(1, "cam-a", &[1], "09:00", "18:00"),
            schedule(2, "cam-b", &[1], "09:00", "18:00"),
        ];
        let mut terminal = HashSet::new();
        terminal.insert(RecordingKey::new("cam-a", 1));

        let desired = desired_schedules(&schedules, monday(9, 30), &terminal);
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].camera_name, "cam-b");
    }

    #[test]
    fn test_terminal_key_matches_exact_pair_only() {
        // Same camera, different schedule id: still desired.
        let schedules = vec![schedule(2, "cam", &[1], "09:00", "18:00")];
        let mut terminal = HashSet::new();
        terminal.insert(RecordingKey::new("cam", 1));
        assert_eq!(desired_schedules(&schedules, monday(9, 30), &terminal).len(), 1);
    }
}
