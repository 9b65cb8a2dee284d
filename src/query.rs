//! Query pipeline: REQ -> store scan -> EVENT* -> EOSE ->
//! optional live registration.

use crate::admission::AdmissionPolicy;
use crate::auth::AuthState;
use crate::config::Config;
use crate::error::RelayError;
use crate::model::Filter;
use crate::registry::{ConnId, Registry};
use crate::store::Store;

pub struct QueryContext<'a, S: Store + ?Sized> {
    pub store: &'a S,
    pub registry: &'a Registry,
    pub admission: &'a dyn AdmissionPolicy,
    pub auth: &'a mut AuthState,
    pub config: &'a Config,
    pub conn_id: ConnId,
}

/// Runs one REQ and returns the frames to send back to the requesting
/// connection, in order: zero or more `EVENT`, then `EOSE`, then
/// optionally `CLOSED`.
pub async fn handle_req<S: Store + ?Sized>(
    sub_id: String,
    filters: Vec<Filter>,
    ctx: &mut QueryContext<'_, S>,
) -> Vec<String> {
    // Step 1: admission.
    if ctx.config.auth_required && !ctx.config.public_readable && !ctx.auth.is_authed() {
        let mut out = vec![closed_frame(&sub_id, &RelayError::AuthRequired.reason())];
        if !ctx.auth.auth_requested {
            out.push(auth_challenge_frame(ctx.auth.issue_challenge()));
        }
        return out;
    }

    let mut out = Vec::new();
    let mut every_filter_exhausted = true;

    // Step 2: per-filter scan.
    for filter in &filters {
        let limit = filter.limit_or_default(ctx.config.max_limit);
        if limit == 0 {
            // Boundary behavior: a zero limit never scans.
            continue;
        }

        let events = match ctx.store.query(filter, limit).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(sub_id = %sub_id, error = %e, "store query failed");
                continue;
            }
        };

        let reached_limit = events.len() >= limit;
        for event in events.into_iter().take(limit) {
            out.push(event_frame(&sub_id, &event));
        }

        if !(filter.is_id_bound() || reached_limit) {
            every_filter_exhausted = false;
        }
    }

    // Step 3: EOSE.
    out.push(eose_frame(&sub_id));

    // Step 4: closure policy. A subscription is short-lived when every
    // filter either names specific ids or exhausted its limit during the
    // scan; otherwise it is registered for live fan-out. An empty filter
    // set behaves like a fully-exhausted scan.
    if filters.is_empty() || every_filter_exhausted {
        // A short-lived REQ that reuses a sub_id already registered as a
        // live subscription must still replace it -- otherwise the prior
        // registration is left behind, keeps matching, and goes on
        // receiving fan-out under a sub_id the client was just told is
        // closed.
        ctx.registry.remove(ctx.conn_id, &sub_id).await;
        out.push(closed_frame(&sub_id, ""));
    } else {
        // A REQ with an already-live sub_id replaces the prior
        // registration; `Registry::add` already implements replace-on-insert.
        ctx.registry.add(ctx.conn_id, sub_id, filters).await;
    }

    out
}

/// CLOSE from the client: remove the named subscription, no reply.
pub async fn handle_close(registry: &Registry, conn_id: ConnId, sub_id: &str) {
    registry.remove(conn_id, sub_id).await;
}

fn event_frame(sub_id: &str, event: &crate::model::Event) -> String {
    serde_json::json!(["EVENT", sub_id, event]).to_string()
}

fn eose_frame(sub_id: &str) -> String {
    serde_json::json!(["EOSE", sub_id]).to_string()
}

fn closed_frame(sub_id: &str, reason: &str) -> String {
    serde_json::json!(["CLOSED", sub_id, reason]).to_string()
}

fn auth_challenge_frame(challenge: String) -> String {
    serde_json::json!(["AUTH", challenge]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AllowAll;
    use crate::metrics::Metrics;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct MemStore {
        events: StdMutex<Vec<crate::model::Event>>,
    }

    #[async_trait]
    impl Store for MemStore {
        async fn save(&self, _event: &crate::model::Event) -> crate::error::Result<crate::store::SaveOutcome> {
            unimplemented!()
        }
        async fn get(&self, _id: &str) -> crate::error::Result<Option<crate::model::Event>> {
            unimplemented!()
        }
        async fn query(
            &self,
            filter: &Filter,
            limit: usize,
        ) -> crate::error::Result<Vec<crate::model::Event>> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| crate::model::matcher::matches(filter, e))
                .take(limit)
                .cloned()
                .collect())
        }
        async fn is_tombstoned(&self, _id: &str) -> crate::error::Result<bool> {
            Ok(false)
        }
        async fn delete(&self, _id: &str, _tombstone: bool) -> crate::error::Result<()> {
            Ok(())
        }
        async fn replaceable_existing(
            &self,
            _pubkey: &str,
            _kind: u16,
        ) -> crate::error::Result<Vec<crate::model::Event>> {
            Ok(vec![])
        }
        async fn parameterized_existing(
            &self,
            _pubkey: &str,
            _kind: u16,
            _d_tag: &str,
        ) -> crate::error::Result<Vec<crate::model::Event>> {
            Ok(vec![])
        }
        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn config() -> Config {
        Config {
            auth_required: false,
            public_readable: true,
            max_filters_per_req: 10,
            max_limit: 500,
            service_url: "wss://relay.example".into(),
            database_url: String::new(),
            redis_url: None,
            bind_addr: "0.0.0.0:0".into(),
            outbound_queue_capacity: 16,
            idle_timeout_secs: 28,
            ping_interval_secs: 10,
            store_op_timeout_secs: 10,
        }
    }

    #[tokio::test]
    async fn empty_filter_set_closes_immediately() {
        let store = MemStore::default();
        let registry = Registry::new(Arc::new(Metrics::new()));
        let config = config();
        let admission = AllowAll;
        let mut auth = AuthState::new(false);
        let mut ctx = QueryContext {
            store: &store,
            registry: &registry,
            admission: &admission,
            auth: &mut auth,
            config: &config,
            conn_id: 1,
        };
        let out = handle_req("s1".into(), vec![], &mut ctx).await;
        assert_eq!(out, vec![eose_frame("s1"), closed_frame("s1", "")]);
    }

    #[tokio::test]
    async fn zero_limit_filter_closes_immediately() {
        let store = MemStore::default();
        let registry = Registry::new(Arc::new(Metrics::new()));
        let config = config();
        let admission = AllowAll;
        let mut auth = AuthState::new(false);
        let mut ctx = QueryContext {
            store: &store,
            registry: &registry,
            admission: &admission,
            auth: &mut auth,
            config: &config,
            conn_id: 1,
        };
        let filter = Filter::parse(&serde_json::json!({"limit": 0}), 500).unwrap();
        let out = handle_req("s1".into(), vec![filter], &mut ctx).await;
        assert_eq!(out, vec![eose_frame("s1"), closed_frame("s1", "")]);
    }

    #[tokio::test]
    async fn open_ended_filter_registers_live_subscription() {
        let store = MemStore::default();
        let registry = Registry::new(Arc::new(Metrics::new()));
        let config = config();
        let admission = AllowAll;
        let mut auth = AuthState::new(false);
        let mut ctx = QueryContext {
            store: &store,
            registry: &registry,
            admission: &admission,
            auth: &mut auth,
            config: &config,
            conn_id: 1,
        };
        let filter = Filter::parse(&serde_json::json!({"kinds": [1]}), 500).unwrap();
        let out = handle_req("s1".into(), vec![filter], &mut ctx).await;
        assert_eq!(out, vec![eose_frame("s1")]);
    }

    /// A REQ reusing a sub_id that is currently live must tear down the
    /// prior registration even when the new REQ itself turns out to be
    /// short-lived, otherwise the old live subscription keeps matching
    /// under a sub_id the client was just told is closed.
    #[tokio::test]
    async fn short_lived_req_replaces_and_removes_prior_live_subscription() {
        let store = MemStore::default();
        let registry = Registry::new(Arc::new(Metrics::new()));
        let config = config();
        let admission = AllowAll;
        let mut auth = AuthState::new(false);
        let conn_id = registry.next_conn_id();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register_connection(conn_id, tx).await;

        {
            let mut ctx = QueryContext {
                store: &store,
                registry: &registry,
                admission: &admission,
                auth: &mut auth,
                config: &config,
                conn_id,
            };
            let filter = Filter::parse(&serde_json::json!({"kinds": [1]}), 500).unwrap();
            let out = handle_req("s1".into(), vec![filter], &mut ctx).await;
            assert_eq!(out, vec![eose_frame("s1")]);
        }

        {
            let mut ctx = QueryContext {
                store: &store,
                registry: &registry,
                admission: &admission,
                auth: &mut auth,
                config: &config,
                conn_id,
            };
            let filter = Filter::parse(&serde_json::json!({"ids": ["ab"]}), 500).unwrap();
            let out = handle_req("s1".into(), vec![filter], &mut ctx).await;
            assert_eq!(out, vec![eose_frame("s1"), closed_frame("s1", "")]);
        }

        let event = crate::model::Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "c".repeat(128),
        };
        registry.dispatch(&event).await;
        assert!(
            rx.try_recv().is_err(),
            "the torn-down live subscription must not still receive fan-out"
        );
    }
}
