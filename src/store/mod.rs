//! Store interface: consumed, not specified at the byte level.
//! The core only ever talks to this trait; indexing and persistence layout
//! are the implementation's business.

pub mod cache;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Event, Filter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Duplicate,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Durable, idempotent on `id`.
    async fn save(&self, event: &Event) -> Result<SaveOutcome>;

    /// Fetch a single event by id regardless of visibility/tombstone state
    /// -- used by deletion processing to check the target's `pubkey`/`kind`.
    async fn get(&self, id: &str) -> Result<Option<Event>>;

    /// A finite sequence of events matching `filter`, in descending
    /// `created_at`, ties broken by ascending `id` bytes, bounded to at most
    /// `limit` events. Excludes events shadowed by a newer
    /// replaceable/parameterized-replaceable version and tombstoned ids.
    async fn query(&self, filter: &Filter, limit: usize) -> Result<Vec<Event>>;

    /// Whether `id` was previously deleted with `tombstone = true`.
    async fn is_tombstoned(&self, id: &str) -> Result<bool>;

    /// Removes an event from query results. If `tombstone` is true, records
    /// that `id` must not be re-saved.
    async fn delete(&self, id: &str, tombstone: bool) -> Result<()>;

    /// Current (non-superseded, non-tombstoned) events for a replaceable
    /// (pubkey, kind) pair -- used by the ingestion pipeline's replacement
    /// check, not general querying.
    async fn replaceable_existing(&self, pubkey: &str, kind: u16) -> Result<Vec<Event>>;

    /// As `replaceable_existing`, additionally keyed on the d-tag value.
    async fn parameterized_existing(
        &self,
        pubkey: &str,
        kind: u16,
        d_tag: &str,
    ) -> Result<Vec<Event>>;

    /// Flush and release.
    async fn close(&self) -> Result<()>;
}
