//! Retention settings stored in the settings record.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retention configuration, re-read on each cleanup cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Media files older than this many days are purged.
    pub retention_days: u32,
    /// Duration of one segment in segmented mode.
    pub segment_duration_secs: u32,
    /// Maximum segments kept per camera/day manifest (1440 = 24h at 1 min).
    pub max_segments: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            segment_duration_secs: 60,
            max_segments: 1440,
        }
    }
}

impl RetentionSettings {
    /// Replace out-of-range values with defaults rather than letting a bad
    /// settings record disable retention entirely.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.retention_days == 0 {
            warn!("retention_days of 0 is invalid, using {}", defaults.retention_days);
            self.retention_days = defaults.retention_days;
        }
        if self.segment_duration_secs == 0 {
            warn!(
                "segment_duration_secs of 0 is invalid, using {}",
                defaults.segment_duration_secs
            );
            self.segment_duration_secs = defaults.segment_duration_secs;
        }
        if self.max_segments == 0 {
            warn!("max_segments of 0 is invalid, using {}", defaults.max_segments);
            self.max_segments = defaults.max_segments;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = RetentionSettings::default();
        assert_eq!(s.retention_days, 30);
        assert_eq!(s.segment_duration_secs, 60);
        assert_eq!(s.max_segments, 1440);
    }

    #[test]
    fn test_validated_replaces_zeros() {
        let s = RetentionSettings {
            retention_days: 0,
            segment_duration_secs: 0,
            max_segments: 0,
        }
        .validated();
        assert_eq!(s, RetentionSettings::default());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let s: RetentionSettings = serde_json::from_str(r#"{"retention_days": 7}"#).unwrap();
        assert_eq!(s.retention_days, 7);
        assert_eq!(s.max_segments, 1440);
    }
}
