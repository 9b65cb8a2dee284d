//! Kind classes: the policy attached to numeric kind ranges.

/// How a given event `kind` is persisted and replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Stored verbatim; multiple events per (pubkey, kind) allowed.
    Regular,
    /// Newest by `created_at` wins for a given (pubkey, kind).
    Replaceable,
    /// Newest wins for a given (pubkey, kind, d-tag value).
    ParameterizedReplaceable,
    /// Never stored; dispatched to live subscriptions only.
    Ephemeral,
    /// Kind 5: references other events for deletion.
    Deletion,
}

pub const DELETION_KIND: u16 = 5;

/// Classify a kind per its numeric range:
/// - 0, 3, 41, 10000-19999: replaceable
/// - 20000-29999: ephemeral
/// - 30000-39999: parameterized replaceable
/// - 5: deletion
/// - everything else: regular
pub fn classify(kind: u16) -> KindClass {
    match kind {
        DELETION_KIND => KindClass::Deletion,
        0 | 3 | 41 => KindClass::Replaceable,
        10_000..=19_999 => KindClass::Replaceable,
        20_000..=29_999 => KindClass::Ephemeral,
        30_000..=39_999 => KindClass::ParameterizedReplaceable,
        _ => KindClass::Regular,
    }
}

/// First value of the first tag whose key is `"d"`. Parameterized
/// replaceable events with no `d` tag are keyed on the empty string.
pub fn d_tag_value(tags: &[Vec<String>]) -> String {
    tags.iter()
        .find(|t| t.first().map(String::as_str) == Some("d"))
        .and_then(|t| t.get(1))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_ranges() {
        assert_eq!(classify(5), KindClass::Deletion);
        assert_eq!(classify(0), KindClass::Replaceable);
        assert_eq!(classify(3), KindClass::Replaceable);
        assert_eq!(classify(41), KindClass::Replaceable);
        assert_eq!(classify(10_002), KindClass::Replaceable);
        assert_eq!(classify(20_001), KindClass::Ephemeral);
        assert_eq!(classify(30_001), KindClass::ParameterizedReplaceable);
        assert_eq!(classify(1), KindClass::Regular);
        assert_eq!(classify(40_000), KindClass::Regular);
    }

    #[test]
    fn d_tag_defaults_empty() {
        assert_eq!(d_tag_value(&[]), "");
        assert_eq!(
            d_tag_value(&[vec!["e".into(), "x".into()], vec!["d".into(), "abc".into()]]),
            "abc"
        );
    }
}
