//! Topic construction and device-id extraction
//!
//! Device topics follow `<base>/<device_id>`; the device id is always the
//! last path segment, trimmed of surrounding whitespace.

use thiserror::Error;

/// Extract the device id from a topic: the trimmed final `/` segment, or the
/// trimmed whole topic when it has no separator. Returns `None` when the
/// result is empty.
pub fn extract_device_id(topic: &str) -> Option<String> {
    let segment = topic.rsplit('/').next().unwrap_or(topic);
    normalize_device_id(segment)
}

/// Trim a device id, rejecting ids that are empty after trimming
pub fn normalize_device_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Trim whitespace and trailing separators from a base topic
pub fn normalize_base_topic(base: &str) -> String {
    base.trim().trim_end_matches('/').to_string()
}

/// Per-device topic: `<base>/<device_id>`
pub fn device_topic(base: &str, device_id: &str) -> String {
    format!("{}/{}", normalize_base_topic(base), device_id)
}

/// Multi-level wildcard covering every device under `base`
pub fn wildcard_topic(base: &str) -> String {
    format!("{}/#", normalize_base_topic(base))
}

/// Validate a subscription filter: non-empty, `#` only as the final level,
/// `+` only as a whole level.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.trim().is_empty() {
        return Err(TopicError::Empty);
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(TopicError::MisplacedWildcard(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedWildcard(filter.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("topic filter cannot be empty")]
    Empty,
    #[error("wildcard in invalid position: '{0}'")]
    MisplacedWildcard(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn extraction_returns_trimmed_final_segment(
            prefix in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
            id in "[A-Za-z0-9_-]{1,16}",
            pad_left in " {0,3}",
            pad_right in " {0,3}",
        ) {
            let topic = format!("{prefix}/{pad_left}{id}{pad_right}");
            prop_assert_eq!(extract_device_id(&topic), Some(id));
        }

        #[test]
        fn extraction_without_separator_uses_whole_topic(
            id in "[A-Za-z0-9_-]{1,16}",
            pad in " {0,3}",
        ) {
            let topic = format!("{pad}{id}{pad}");
            prop_assert_eq!(extract_device_id(&topic), Some(id));
        }

        #[test]
        fn whitespace_final_segment_yields_none(
            prefix in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
            blank in "[ \t]{0,4}",
        ) {
            let topic = format!("{prefix}/{blank}");
            prop_assert_eq!(extract_device_id(&topic), None);
        }

        #[test]
        fn device_topic_round_trips_through_extraction(
            base in "[a-z]{1,8}(/[a-z]{1,8}){0,2}",
            id in "[A-Za-z0-9_-]{1,16}",
        ) {
            let topic = device_topic(&base, &id);
            prop_assert_eq!(extract_device_id(&topic), Some(id));
        }
    }

    #[test]
    fn test_extraction_examples() {
        assert_eq!(
            extract_device_id("bms/telemetry/PACK007 "),
            Some("PACK007".to_string())
        );
        assert_eq!(extract_device_id("PACK001"), Some("PACK001".to_string()));
        assert_eq!(extract_device_id("bms/telemetry/"), None);
        assert_eq!(extract_device_id("   "), None);
        assert_eq!(extract_device_id(""), None);
    }

    #[test]
    fn test_topic_builders() {
        assert_eq!(device_topic("bms/telemetry", "P1"), "bms/telemetry/P1");
        assert_eq!(device_topic(" bms/telemetry/ ", "P1"), "bms/telemetry/P1");
        assert_eq!(wildcard_topic("bms/telemetry/"), "bms/telemetry/#");
    }

    #[test]
    fn test_topic_filter_validation() {
        assert!(validate_topic_filter("bms/telemetry/#").is_ok());
        assert!(validate_topic_filter("bms/+/status").is_ok());
        assert!(validate_topic_filter("bms/#/status").is_err());
        assert!(validate_topic_filter("bms/tele+/x").is_err());
        assert_eq!(validate_topic_filter("  "), Err(TopicError::Empty));
    }
}
