//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are not matched by a leading wildcard

/// Maximum length of a topic name or filter in bytes
pub const MAX_TOPIC_LEN: usize = 65535;

/// Prefix of broker-internal topics that are never persisted as retained
pub const SYS_PREFIX: &str = "$SYS";

/// Whether a topic belongs to the broker's `$SYS` tree
pub fn is_sys_topic(topic: &str) -> bool {
    topic.starts_with(SYS_PREFIX)
}

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
