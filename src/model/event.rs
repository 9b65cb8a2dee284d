//! The immutable event record.

use serde::{Deserialize, Serialize};

/// A signed Nostr event. `id`/`pubkey` are lowercase hex of a 32-byte value,
/// `sig` is lowercase hex of 64 bytes, `tags` is an ordered sequence of
/// ordered string sequences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// First value of the first tag whose key equals `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(key))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All values of tags whose key equals `key`.
    pub fn tag_values<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(key))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }

    pub fn d_tag(&self) -> String {
        crate::model::kind::d_tag_value(&self.tags)
    }
}
