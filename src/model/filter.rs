//! REQ filters.
//!
//! Filters are parsed directly from JSON rather than through a strict
//! typed intermediate, because `ids` must accept hex *prefixes* shorter
//! than the full 32-byte id -- a detail NIP-01's nominal `ids: EventId[]`
//! typing does not express, but this relay supports.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::RelayError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    /// `#e`, `#p`, ... keyed on the single-character tag name.
    pub tags: HashMap<char, HashSet<String>>,
}

impl Filter {
    /// A filter is short-lived when it names specific
    /// ids, since those can never produce new future matches once the
    /// historical scan is exhausted.
    pub fn is_id_bound(&self) -> bool {
        self.ids.as_ref().is_some_and(|ids| !ids.is_empty())
    }

    pub fn limit_or_default(&self, max: usize) -> usize {
        self.limit.map_or(max, |l| l.min(max))
    }

    pub fn parse(value: &Value, max_limit: usize) -> Result<Filter, RelayError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RelayError::MalformedFrame("filter must be a JSON object".into()))?;

        let mut filter = Filter::default();

        if let Some(v) = obj.get("ids") {
            filter.ids = Some(string_array(v, "ids")?);
        }
        if let Some(v) = obj.get("authors") {
            filter.authors = Some(string_array(v, "authors")?);
        }
        if let Some(v) = obj.get("kinds") {
            let arr = v
                .as_array()
                .ok_or_else(|| RelayError::MalformedFrame("kinds must be an array".into()))?;
            let mut kinds = Vec::with_capacity(arr.len());
            for k in arr {
                let n = k
                    .as_u64()
                    .ok_or_else(|| RelayError::MalformedFrame("kind must be a number".into()))?;
                kinds.push(n as u16);
            }
            filter.kinds = Some(kinds);
        }
        if let Some(v) = obj.get("since") {
            filter.since = v.as_i64();
        }
        if let Some(v) = obj.get("until") {
            filter.until = v.as_i64();
        }
        if let Some(v) = obj.get("limit") {
            let l = v
                .as_u64()
                .ok_or_else(|| RelayError::MalformedFrame("limit must be a number".into()))?;
            filter.limit = Some((l as usize).min(max_limit));
        }

        for (key, v) in obj {
            if key.len() == 2 && key.starts_with('#') {
                let tag_char = key.chars().nth(1).unwrap();
                let values = string_array(v, key)?;
                filter.tags.entry(tag_char).or_default().extend(values);
            }
        }

        Ok(filter)
    }

    /// Parse every filter in a REQ's filter-array, enforcing
    /// `max_filters_per_req`.
    pub fn parse_all(
        values: &[Value],
        max_filters: usize,
        max_limit: usize,
    ) -> Result<Vec<Filter>, RelayError> {
        if values.len() > max_filters {
            return Err(RelayError::Unsupported(format!(
                "too many filters in REQ: {} > {}",
                values.len(),
                max_filters
            )));
        }
        values.iter().map(|v| Filter::parse(v, max_limit)).collect()
    }
}

fn string_array(v: &Value, field: &str) -> Result<Vec<String>, RelayError> {
    v.as_array()
        .ok_or_else(|| RelayError::MalformedFrame(format!("{field} must be an array")))?
        .iter()
        .map(|s| {
            s.as_str()
                .map(str::to_owned)
                .ok_or_else(|| RelayError::MalformedFrame(format!("{field} entries must be strings")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tag_predicates() {
        let f = Filter::parse(&json!({"#e": ["abc", "def"], "kinds": [1]}), 500).unwrap();
        assert_eq!(f.kinds, Some(vec![1]));
        assert_eq!(
            f.tags.get(&'e').unwrap(),
            &HashSet::from(["abc".to_string(), "def".to_string()])
        );
    }

    #[test]
    fn caps_limit_to_max() {
        let f = Filter::parse(&json!({"limit": 10000}), 500).unwrap();
        assert_eq!(f.limit, Some(500));
    }

    #[test]
    fn too_many_filters_rejected() {
        let filters = vec![json!({}); 11];
        let err = Filter::parse_all(&filters, 10, 500).unwrap_err();
        assert!(matches!(err, RelayError::Unsupported(_)));
    }
}
