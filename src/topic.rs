//! MQTT-style topic matching shared by the event bus and the connection pool.

/// Does `topic` match the subscription `pattern`?
///
/// `+` matches exactly one non-empty level, `#` matches any number of
/// trailing levels (including none) and must be the last level. Matching is
/// anchored at both ends.
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    let mut levels = topic.split('/');
    let mut filters = pattern.split('/').peekable();

    while let Some(filter) = filters.next() {
        if filter == "#" {
            return filters.peek().is_none();
        }
        let Some(level) = levels.next() else {
            return false;
        };
        match filter {
            "+" if !level.is_empty() => {}
            "+" => return false,
            _ if filter == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

/// A pattern is valid when `#` only appears as the last full level and `+`
/// only as a full level.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let levels: Vec<&str> = pattern.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| {
        if level.contains('#') {
            *level == "#" && i == levels.len() - 1
        } else if level.contains('+') {
            *level == "+"
        } else {
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("status/+", "status/n1"));
        assert!(!matches("status/+", "status/n1/x"));
        assert!(!matches("status/+", "status/"));
        assert!(matches("+/b", "a/b"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("#", "anything/at/all"));
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b/c"));
        assert!(!matches("a/#", "b/c"));
        assert!(matches("a/+/#", "a/b/c/d"));
    }

    #[test]
    fn test_anchored() {
        assert!(!matches("notification", "notification/flows"));
        assert!(!matches("flows", "notification/flows"));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(is_valid_pattern("a/+/#"));
        assert!(!is_valid_pattern("a/#/b"));
        assert!(!is_valid_pattern("a/b+"));
        assert!(!is_valid_pattern(""));
    }
}
