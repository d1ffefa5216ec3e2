//! Composite keys: `{host_id}:{short_id}`.
//!
//! Hosts are UUIDs (which contain dashes but never colons), so splitting on
//! the first colon is unambiguous.

/// Build the composite key for a per-(host, container|deployment) row.
pub fn make_composite_key(host_id: &str, short_id: &str) -> String {
    format!("{host_id}:{short_id}")
}

/// Split a composite key into (host_id, short_id).
/// Returns None when no colon is present.
pub fn parse_composite_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Truncate a full container id to the 12-char short form Docker displays.
pub fn short_id(container_id: &str) -> &str {
    if container_id.len() > 12 {
        &container_id[..12]
    } else {
        container_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_roundtrip() {
        let key = make_composite_key("550e8400-e29b-41d4-a716-446655440000", "abc123def456");
        let (host, cid) = parse_composite_key(&key).unwrap();
        assert_eq!(host, "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(cid, "abc123def456");
    }

    #[test]
    fn test_parse_without_colon() {
        assert!(parse_composite_key("not-a-composite").is_none());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("abc123def456789"), "abc123def456");
        assert_eq!(short_id("abc"), "abc");
    }
}
