//! Filter matching against an event.

use crate::model::event::Event;
use crate::model::filter::Filter;

/// `since`/`until` are inclusive. Absent fields are "don't care". Predicates
/// are checked cheapest-first: kind set, author set, time window, id set,
/// then tag predicates.
pub fn matches(filter: &Filter, event: &Event) -> bool {
    if let Some(kinds) = &filter.kinds {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }

    if let Some(authors) = &filter.authors {
        if !authors.iter().any(|a| a == &event.pubkey) {
            return false;
        }
    }

    if let Some(since) = filter.since {
        if event.created_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if event.created_at > until {
            return false;
        }
    }

    if let Some(ids) = &filter.ids {
        let hit = ids.iter().any(|id| id_matches(id, &event.id));
        if !hit {
            return false;
        }
    }

    for (tag_char, values) in &filter.tags {
        let key = tag_char.to_string();
        let has_match = event
            .tags
            .iter()
            .any(|t| t.first().map(String::as_str) == Some(key.as_str())
                && t.get(1).is_some_and(|v| values.contains(v)));
        if !has_match {
            return false;
        }
    }

    true
}

/// Id set supports prefix match when the filter entry is shorter than the
/// full 32-byte hex length.
fn id_matches(filter_id: &str, event_id: &str) -> bool {
    if filter_id.len() >= event_id.len() {
        filter_id.eq_ignore_ascii_case(event_id)
    } else {
        event_id
            .get(..filter_id.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(filter_id))
    }
}

/// A subscription's filter set is a disjunction: the event matches the
/// subscription iff it matches any one filter. A filter with no predicates
/// at all matches every event.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| matches(f, event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::filter::Filter;
    use serde_json::json;

    fn event() -> Event {
        Event {
            id: "abcd1234".to_string() + &"0".repeat(56),
            pubkey: "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798".into(),
            created_at: 1000,
            kind: 1,
            tags: vec![vec!["e".into(), "target".into()]],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::parse(&json!({}), 500).unwrap();
        assert!(matches(&f, &event()));
    }

    #[test]
    fn id_prefix_matches() {
        let f = Filter::parse(&json!({"ids": ["abcd1234"]}), 500).unwrap();
        assert!(matches(&f, &event()));
        let f = Filter::parse(&json!({"ids": ["ffff"]}), 500).unwrap();
        assert!(!matches(&f, &event()));
    }

    #[test]
    fn since_until_inclusive() {
        let f = Filter::parse(&json!({"since": 1000, "until": 1000}), 500).unwrap();
        assert!(matches(&f, &event()));
        let f = Filter::parse(&json!({"since": 1001}), 500).unwrap();
        assert!(!matches(&f, &event()));
    }

    #[test]
    fn tag_predicate_requires_membership() {
        let f = Filter::parse(&json!({"#e": ["target"]}), 500).unwrap();
        assert!(matches(&f, &event()));
        let f = Filter::parse(&json!({"#e": ["other"]}), 500).unwrap();
        assert!(!matches(&f, &event()));
    }

    #[test]
    fn matches_any_is_disjunction() {
        let miss = Filter::parse(&json!({"kinds": [9]}), 500).unwrap();
        let hit = Filter::parse(&json!({"kinds": [1]}), 500).unwrap();
        assert!(matches_any(&[miss, hit], &event()));
    }
}
