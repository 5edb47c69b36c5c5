//! Camera-name sanitization for filesystem paths.
//!
//! Camera names are user supplied and become directory names under the
//! recording root, so anything that is unsafe in a path component is
//! replaced before it reaches the filesystem.

/// Characters rejected in path components across platforms.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved device names (case-insensitive).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitize a camera identifier for use as a single path component.
///
/// Control characters and path-unsafe characters collapse to a single
/// underscore, leading/trailing dots and spaces are trimmed, and reserved
/// device names are prefixed. An empty result becomes `"camera"`.
pub fn sanitize_camera_name(input: &str) -> String {
    if input.is_empty() {
        return "camera".to_string();
    }

    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "camera".to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{reserved}.")) {
            return format!("_{trimmed}");
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name() {
        assert_eq!(sanitize_camera_name(""), "camera");
        assert_eq!(sanitize_camera_name("???"), "_");
    }

    #[test]
    fn test_path_separators_replaced() {
        assert_eq!(sanitize_camera_name("lobby/north"), "lobby_north");
        assert_eq!(sanitize_camera_name("..\\..\\etc"), "_.._etc");
    }

    #[test]
    fn test_consecutive_invalid_collapse() {
        assert_eq!(sanitize_camera_name("gate<>:cam"), "gate_cam");
    }

    #[test]
    fn test_reserved_names_prefixed() {
        assert_eq!(sanitize_camera_name("CON"), "_CON");
        assert_eq!(sanitize_camera_name("aux.rear"), "_aux.rear");
    }

    #[test]
    fn test_unicode_preserved() {
        assert_eq!(sanitize_camera_name("정문카메라"), "정문카메라");
        assert_eq!(sanitize_camera_name("정문?카메라"), "정문_카메라");
    }

    #[test]
    fn test_idempotent() {
        for input in ["lobby/north", "CON", "  cam  ", "a<b>c"] {
            let once = sanitize_camera_name(input);
            assert_eq!(once, sanitize_camera_name(&once));
        }
    }
}
