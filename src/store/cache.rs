//! Optional layer-2 cache in front of an authoritative backing store. The
//! layering is transparent to callers: a `CachingStore` is itself a `Store`,
//! so it drops in anywhere a bare backing store would go. Backed by Redis.

use async_trait::async_trait;
use deadpool_redis::{redis::AsyncCommands, Pool};

use crate::error::Result;
use crate::model::{Event, Filter};
use crate::store::{SaveOutcome, Store};

const VERSION_KEY: &str = "relay:cache:version";
const QUERY_TTL_SECS: u64 = 30;

/// Wraps any `Store` with a bounded-TTL Redis cache of `query` results.
/// Any write bumps a version counter that is folded into every cache key,
/// which invalidates the whole cache in O(1) instead of scanning for keys
/// to evict.
pub struct CachingStore<S: Store> {
    inner: S,
    redis: Pool,
}

impl<S: Store> CachingStore<S> {
    pub fn new(inner: S, redis: Pool) -> Self {
        CachingStore { inner, redis }
    }

    async fn version(&self) -> Result<i64> {
        let mut conn = self.redis.get().await.map_err(|e| {
            crate::error::RelayError::StoreTransient(format!("redis pool: {e}"))
        })?;
        let v: i64 = conn.incr(VERSION_KEY, 0).await.unwrap_or(0);
        Ok(v)
    }

    async fn bump_version(&self) {
        if let Ok(mut conn) = self.redis.get().await {
            let _: Result<i64, _> = conn.incr(VERSION_KEY, 1).await;
        }
    }

    /// `Filter`'s tag predicates are a `HashMap<char, HashSet<String>>`,
    /// whose `Debug` iteration order is not stable across equal maps, so
    /// the key is built from sorted tag entries instead of `{filter:?}`.
    fn cache_key(version: i64, filter: &Filter, limit: usize) -> String {
        let mut tags: Vec<(char, Vec<&str>)> = filter
            .tags
            .iter()
            .map(|(tag, values)| {
                let mut values: Vec<&str> = values.iter().map(String::as_str).collect();
                values.sort_unstable();
                (*tag, values)
            })
            .collect();
        tags.sort_unstable_by_key(|(tag, _)| *tag);

        format!(
            "relay:cache:v{version}:{limit}:{:?}:{:?}:{:?}:{:?}:{:?}:{:?}",
            filter.ids, filter.authors, filter.kinds, filter.since, filter.until, tags
        )
    }
}

#[async_trait]
impl<S: Store> Store for CachingStore<S> {
    async fn save(&self, event: &Event) -> Result<SaveOutcome> {
        let outcome = self.inner.save(event).await?;
        self.bump_version().await;
        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<Event>> {
        self.inner.get(id).await
    }

    async fn query(&self, filter: &Filter, limit: usize) -> Result<Vec<Event>> {
        let version = self.version().await.unwrap_or(0);
        let key = Self::cache_key(version, filter, limit);

        if let Ok(mut conn) = self.redis.get().await {
            if let Ok(Some(cached)) = conn.get::<_, Option<String>>(&key).await {
                if let Ok(events) = serde_json::from_str::<Vec<Event>>(&cached) {
                    return Ok(events);
                }
            }
        }

        let events = self.inner.query(filter, limit).await?;

        if let Ok(mut conn) = self.redis.get().await {
            if let Ok(serialized) = serde_json::to_string(&events) {
                let _: Result<(), _> = conn.set_ex(&key, serialized, QUERY_TTL_SECS).await;
            }
        }

        Ok(events)
    }

    async fn is_tombstoned(&self, id: &str) -> Result<bool> {
        self.inner.is_tombstoned(id).await
    }

    async fn delete(&self, id: &str, tombstone: bool) -> Result<()> {
        self.inner.delete(id, tombstone).await?;
        self.bump_version().await;
        Ok(())
    }

    async fn replaceable_existing(&self, pubkey: &str, kind: u16) -> Result<Vec<Event>> {
        self.inner.replaceable_existing(pubkey, kind).await
    }

    async fn parameterized_existing(
        &self,
        pubkey: &str,
        kind: u16,
        d_tag: &str,
    ) -> Result<Vec<Event>> {
        self.inner.parameterized_existing(pubkey, kind, d_tag).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
