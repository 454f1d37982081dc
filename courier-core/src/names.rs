//! Topic and channel name validation.
//!
//! Names are 1-32 characters drawn from `[.A-Za-z0-9_-]`; channel names may
//! additionally carry a `#ephemeral` suffix (counted against the length
//! limit).

/// Suffix marking a channel as ephemeral.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Maximum name length, suffix included.
pub const MAX_NAME_LENGTH: usize = 32;

/// Check a topic name for correctness.
pub fn is_valid_topic_name(name: &str) -> bool {
    is_valid_name(name)
}

/// Check a channel name for correctness.
pub fn is_valid_channel_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH || name.is_empty() {
        return false;
    }
    is_valid_name(name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name))
}

/// Whether a channel name requests ephemeral semantics.
pub fn is_ephemeral(name: &str) -> bool {
    name.ends_with(EPHEMERAL_SUFFIX)
}

fn is_valid_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH || name.is_empty() {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert!(is_valid_topic_name("orders"));
        assert!(is_valid_topic_name("orders.v2_backfill-1"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("has space"));
        assert!(!is_valid_topic_name("tab\tname"));
        assert!(!is_valid_topic_name(&"x".repeat(33)));
        assert!(is_valid_topic_name(&"x".repeat(32)));
        // the suffix is not special for topics
        assert!(!is_valid_topic_name("orders#ephemeral"));
    }

    #[test]
    fn channel_names() {
        assert!(is_valid_channel_name("workers"));
        assert!(is_valid_channel_name("workers#ephemeral"));
        assert!(!is_valid_channel_name("#ephemeral"));
        assert!(!is_valid_channel_name("bad name#ephemeral"));
        // suffix counts against the limit
        assert!(!is_valid_channel_name(&format!("{}{}", "x".repeat(23), EPHEMERAL_SUFFIX)));
        assert!(is_valid_channel_name(&format!("{}{}", "x".repeat(22), EPHEMERAL_SUFFIX)));
    }

    #[test]
    fn ephemeral_detection() {
        assert!(is_ephemeral("c#ephemeral"));
        assert!(!is_ephemeral("c"));
    }
}
