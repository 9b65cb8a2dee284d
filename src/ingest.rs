//! Event ingestion pipeline: verify, apply kind-specific
//! rewrite rules, store, dispatch. One call to `handle_event` per inbound
//! `EVENT` envelope.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::admission::AdmissionPolicy;
use crate::auth::AuthState;
use crate::config::Config;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::model::{classify, Event, KindClass};
use crate::registry::Registry;
use crate::store::{SaveOutcome, Store};

/// A deletion scheduled during the kind-specific rewrite, executed only
/// after the triggering event's own save has committed.
struct ScheduledDeletion {
    id: String,
    tombstone: bool,
}

/// Everything `handle_event` needs, gathered per-connection so the
/// function itself stays a pure pipeline over its inputs.
pub struct IngestContext<'a, S: Store + ?Sized> {
    pub store: &'a S,
    pub registry: &'a Registry,
    pub metrics: &'a Metrics,
    pub admission: &'a dyn AdmissionPolicy,
    pub auth: &'a mut AuthState,
    pub config: &'a Config,
    /// The submitting connection's own outbound channel. Used to enqueue
    /// `OK` directly, ahead of `registry.dispatch`, so a connection with a
    /// live subscription matching its own published event never observes
    /// the fan-out `EVENT` before the `OK` for the same id (§5, invariant 8).
    pub tx: &'a mpsc::Sender<String>,
}

/// Runs the full pipeline for one inbound `EVENT` envelope and returns the
/// frames (already JSON-encoded) still owed to the *submitting* connection
/// -- fan-out to other connections happens via `ctx.registry.dispatch` as a
/// side effect, not through the return value. On any path that also
/// dispatches, the `OK` frame is instead sent directly through `ctx.tx`
/// ahead of the dispatch call (so it cannot be overtaken by a fan-out copy
/// of the same event on the submitter's own channel) and the return value
/// is empty.
pub async fn handle_event<S: Store + ?Sized>(
    event: Event,
    ctx: &mut IngestContext<'_, S>,
) -> Vec<String> {
    // Step 1: admission.
    if ctx.config.auth_required && !ctx.auth.is_authed() {
        let mut out = vec![ok_frame(&event.id, false, &RelayError::AuthRequired.reason())];
        if !ctx.auth.auth_requested {
            out.push(auth_challenge_frame(ctx.auth.issue_challenge()));
        }
        ctx.metrics.record_rejected(RelayError::AuthRequired.reason_prefix());
        return out;
    }

    if !ctx.admission.allow_event(&event).await {
        let err = RelayError::Unsupported("event not admitted".into());
        ctx.metrics.record_rejected(err.reason_prefix());
        return vec![ok_frame(&event.id, false, &err.reason())];
    }

    // Steps 2-3: structural + signature check. `codec::verify` recomputes
    // the id before checking the signature, so a bad id is reported as
    // such even when the signature field is also garbage.
    if let Err(e) = crate::model::codec::verify(&event) {
        ctx.metrics.record_rejected(e.reason_prefix());
        return vec![ok_frame(&event.id, false, &e.reason())];
    }

    // Step 4: tombstone check.
    match ctx.store.is_tombstoned(&event.id).await {
        Ok(true) => {
            let e = RelayError::Tombstoned;
            ctx.metrics.record_rejected(e.reason_prefix());
            return vec![ok_frame(&event.id, false, &e.reason())];
        }
        Ok(false) => {}
        Err(e) => {
            ctx.metrics.record_rejected(e.reason_prefix());
            return vec![ok_frame(&event.id, false, &e.reason())];
        }
    }

    // Step 5: kind-specific rewrite.
    let class = classify(event.kind);
    let scheduled = match class {
        KindClass::Ephemeral => {
            // Never stored; dispatch only. OK must reach the submitter's
            // own writer channel before dispatch's fan-out copy does.
            ctx.metrics.record_accepted();
            let _ = ctx.tx.send(ok_frame(&event.id, true, "")).await;
            ctx.registry.dispatch(&event).await;
            return Vec::new();
        }
        KindClass::Replaceable => {
            match replaceable_schedule(ctx.store, &event).await {
                Ok(s) => s,
                Err(e) => {
                    ctx.metrics.record_rejected(e.reason_prefix());
                    return vec![ok_frame(&event.id, false, &e.reason())];
                }
            }
        }
        KindClass::ParameterizedReplaceable => {
            match parameterized_schedule(ctx.store, &event).await {
                Ok(s) => s,
                Err(e) => {
                    ctx.metrics.record_rejected(e.reason_prefix());
                    return vec![ok_frame(&event.id, false, &e.reason())];
                }
            }
        }
        KindClass::Deletion => match deletion_schedule(ctx.store, &event).await {
            Ok(s) => s,
            Err(e) => {
                ctx.metrics.record_rejected(e.reason_prefix());
                return vec![ok_frame(&event.id, false, &e.reason())];
            }
        },
        KindClass::Regular => Vec::new(),
    };

    // Step 6: store save.
    let outcome = match ctx.store.save(&event).await {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.metrics.record_rejected(e.reason_prefix());
            return vec![ok_frame(&event.id, false, &e.reason())];
        }
    };

    if outcome == SaveOutcome::Duplicate {
        // No second dispatch, no re-running of scheduled deletions.
        return vec![ok_frame(&event.id, true, "duplicate:already have this event")];
    }

    // Step 7: post-save deletions. A failure here does not reverse the
    // save; it is logged and otherwise ignored.
    for deletion in scheduled {
        if let Err(e) = ctx.store.delete(&deletion.id, deletion.tombstone).await {
            tracing::warn!(
                target_id = %deletion.id,
                error = %e,
                "post-save scheduled deletion failed"
            );
        }
    }

    // Step 8: dispatch. OK is sent directly to the submitter's own channel
    // first, since `dispatch` enqueues onto that same channel if the
    // submitter holds a live subscription matching its own event.
    ctx.metrics.record_accepted();
    let _ = ctx.tx.send(ok_frame(&event.id, true, "")).await;
    ctx.registry.dispatch(&event).await;
    Vec::new()
}

async fn replaceable_schedule<S: Store + ?Sized>(
    store: &S,
    event: &Event,
) -> crate::error::Result<Vec<ScheduledDeletion>> {
    let existing = store.replaceable_existing(&event.pubkey, event.kind).await?;
    if existing.iter().any(|e| e.created_at > event.created_at) {
        return Err(RelayError::ReplaceableOlder);
    }
    Ok(existing
        .into_iter()
        .filter(|e| e.id != event.id)
        .map(|e| ScheduledDeletion {
            id: e.id,
            tombstone: false,
        })
        .collect())
}

async fn parameterized_schedule<S: Store + ?Sized>(
    store: &S,
    event: &Event,
) -> crate::error::Result<Vec<ScheduledDeletion>> {
    let d_tag = event.d_tag();
    let existing = store
        .parameterized_existing(&event.pubkey, event.kind, &d_tag)
        .await?;
    if existing.iter().any(|e| e.created_at > event.created_at) {
        return Err(RelayError::ParameterizedReplaceableOlder);
    }
    Ok(existing
        .into_iter()
        .filter(|e| e.id != event.id)
        .map(|e| ScheduledDeletion {
            id: e.id,
            tombstone: false,
        })
        .collect())
}

async fn deletion_schedule<S: Store + ?Sized>(
    store: &S,
    event: &Event,
) -> crate::error::Result<Vec<ScheduledDeletion>> {
    let mut scheduled = Vec::new();

    for target_id in event.tag_values("e") {
        let Some(target) = store.get(target_id).await? else {
            continue;
        };
        if target.pubkey != event.pubkey {
            return Err(RelayError::DeletionAuthorMismatch);
        }
        if target.kind == crate::model::kind::DELETION_KIND {
            return Err(RelayError::DeletionInvalidTarget(
                "cannot delete a deletion event".into(),
            ));
        }
        // Explicit user deletions always tombstone.
        scheduled.push(ScheduledDeletion {
            id: target.id,
            tombstone: true,
        });
    }

    for coordinate in event.tag_values("a") {
        let (kind, pubkey, d_tag) = parse_coordinate(coordinate).ok_or_else(|| {
            RelayError::DeletionInvalidTarget(format!("malformed a-tag coordinate: {coordinate}"))
        })?;

        let class = classify(kind);
        if !matches!(class, KindClass::Replaceable | KindClass::ParameterizedReplaceable) {
            return Err(RelayError::DeletionInvalidTarget(
                "a-tag coordinate kind must be replaceable or parameterized replaceable".into(),
            ));
        }
        if kind == crate::model::kind::DELETION_KIND {
            return Err(RelayError::DeletionInvalidTarget(
                "a-tag coordinate must not reference the deletion kind".into(),
            ));
        }
        if pubkey != event.pubkey {
            return Err(RelayError::DeletionAuthorMismatch);
        }
        if kind == event.kind && pubkey == event.pubkey && d_tag == event.d_tag() {
            return Err(RelayError::DeletionInvalidTarget(
                "a-tag coordinate must not reference the deletion event itself".into(),
            ));
        }

        let targets = match class {
            KindClass::ParameterizedReplaceable => {
                store.parameterized_existing(&pubkey, kind, &d_tag).await?
            }
            _ => store.replaceable_existing(&pubkey, kind).await?,
        };

        // Replaceable-kind a-tag targets are never tombstoned so they can
        // still be restored by a later republish.
        let tombstone = matches!(class, KindClass::ParameterizedReplaceable);
        for target in targets {
            if target.created_at > event.created_at {
                continue;
            }
            scheduled.push(ScheduledDeletion {
                id: target.id,
                tombstone,
            });
        }
    }

    Ok(scheduled)
}

/// Parses an `a`-tag coordinate of the form `kind:pubkey_hex:d_value`.
fn parse_coordinate(value: &str) -> Option<(u16, String, String)> {
    let mut parts = value.splitn(3, ':');
    let kind: u16 = parts.next()?.parse().ok()?;
    let pubkey = parts.next()?.to_string();
    let d_tag = parts.next().unwrap_or("").to_string();
    Some((kind, pubkey, d_tag))
}

fn ok_frame(id: &str, accepted: bool, reason: &str) -> String {
    serde_json::json!(["OK", id, accepted, reason]).to_string()
}

fn auth_challenge_frame(challenge: String) -> String {
    serde_json::json!(["AUTH", challenge]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AllowAll;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemStore {
        events: StdMutex<Vec<Event>>,
        tombstones: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Store for MemStore {
        async fn save(&self, event: &Event) -> crate::error::Result<SaveOutcome> {
            let mut events = self.events.lock().unwrap();
            if events.iter().any(|e| e.id == event.id) {
                return Ok(SaveOutcome::Duplicate);
            }
            events.push(event.clone());
            Ok(SaveOutcome::Saved)
        }

        async fn get(&self, id: &str) -> crate::error::Result<Option<Event>> {
            Ok(self.events.lock().unwrap().iter().find(|e| e.id == id).cloned())
        }

        async fn query(
            &self,
            filter: &crate::model::Filter,
            limit: usize,
        ) -> crate::error::Result<Vec<Event>> {
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

        async fn is_tombstoned(&self, id: &str) -> crate::error::Result<bool> {
            Ok(self.tombstones.lock().unwrap().iter().any(|t| t == id))
        }

        async fn delete(&self, id: &str, tombstone: bool) -> crate::error::Result<()> {
            self.events.lock().unwrap().retain(|e| e.id != id);
            if tombstone {
                self.tombstones.lock().unwrap().push(id.to_string());
            }
            Ok(())
        }

        async fn replaceable_existing(
            &self,
            pubkey: &str,
            kind: u16,
        ) -> crate::error::Result<Vec<Event>> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.pubkey == pubkey && e.kind == kind)
                .cloned()
                .collect())
        }

        async fn parameterized_existing(
            &self,
            pubkey: &str,
            kind: u16,
            d_tag: &str,
        ) -> crate::error::Result<Vec<Event>> {
            Ok(self
                .replaceable_existing(pubkey, kind)
                .await?
                .into_iter()
                .filter(|e| e.d_tag() == d_tag)
                .collect())
        }

        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn unsigned_event(kind: u16, created_at: i64, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "a".repeat(64),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    fn ctx_parts() -> (Config, Metrics, Registry, AllowAll, AuthState) {
        let config = Config {
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
        };
        let metrics = Metrics::new();
        let registry = Registry::new(Arc::new(Metrics::new()));
        (config, metrics, registry, AllowAll, AuthState::new(false))
    }

    #[tokio::test]
    async fn auth_required_blocks_unauthenticated_event() {
        let store = MemStore::default();
        let (mut config, metrics, registry, admission, mut auth) = ctx_parts();
        config.auth_required = true;
        let (tx, _rx) = mpsc::channel(8);
        let mut ctx = IngestContext {
            store: &store,
            registry: &registry,
            metrics: &metrics,
            admission: &admission,
            auth: &mut auth,
            config: &config,
            tx: &tx,
        };
        let event = unsigned_event(1, 100, vec![]);
        let out = handle_event(event, &mut ctx).await;
        assert!(out[0].contains("auth-required:"));
        assert!(out[1].contains("\"AUTH\""));
    }

    #[tokio::test]
    async fn bad_id_is_rejected_before_touching_store() {
        let store = MemStore::default();
        let (config, metrics, registry, admission, mut auth) = ctx_parts();
        let (tx, _rx) = mpsc::channel(8);
        let mut ctx = IngestContext {
            store: &store,
            registry: &registry,
            metrics: &metrics,
            admission: &admission,
            auth: &mut auth,
            config: &config,
            tx: &tx,
        };
        let event = unsigned_event(1, 100, vec![]);
        let out = handle_event(event, &mut ctx).await;
        assert!(out[0].contains("invalid:event id is computed incorrectly"));
        assert!(store.events.lock().unwrap().is_empty());
    }

    fn signed_event(kind: u16, created_at: i64, tags: Vec<Vec<String>>, content: &str) -> Event {
        use secp256k1::{Keypair, Secp256k1, SecretKey};

        let secp = Secp256k1::new();
        let mut sk_bytes = [0u8; 32];
        sk_bytes[31] = 1;
        let secret_key = SecretKey::from_slice(&sk_bytes).unwrap();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (xonly, _parity) = keypair.x_only_public_key();

        let mut event = Event {
            id: String::new(),
            pubkey: hex::encode(xonly.serialize()),
            created_at,
            kind,
            tags,
            content: content.to_string(),
            sig: String::new(),
        };
        let id = crate::model::codec::canonical_id(&event);
        event.id = hex::encode(id);
        let msg = secp256k1::Message::from_digest(id);
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
        event.sig = hex::encode(sig.as_ref());
        event
    }

    /// Regression test for the OK-before-fan-out ordering requirement
    /// (spec invariant 8): a connection with a live subscription matching
    /// its own published event must see `OK` arrive on its channel before
    /// the dispatched `EVENT` copy of the same id.
    #[tokio::test]
    async fn ok_is_enqueued_before_self_dispatch() {
        let store = MemStore::default();
        let (config, metrics, registry, admission, mut auth) = ctx_parts();
        let (tx, mut rx) = mpsc::channel(8);
        let conn_id = registry.next_conn_id();
        registry.register_connection(conn_id, tx.clone()).await;
        let filter =
            crate::model::Filter::parse(&serde_json::json!({"kinds": [1]}), 500).unwrap();
        registry.add(conn_id, "s1".into(), vec![filter]).await;

        let event = signed_event(1, 100, vec![], "hello");

        let mut ctx = IngestContext {
            store: &store,
            registry: &registry,
            metrics: &metrics,
            admission: &admission,
            auth: &mut auth,
            config: &config,
            tx: &tx,
        };
        let out = handle_event(event, &mut ctx).await;
        assert!(
            out.is_empty(),
            "OK is sent directly through ctx.tx on the dispatch path, not returned"
        );

        let first = rx.try_recv().expect("OK frame");
        assert!(
            first.contains("\"OK\""),
            "first frame on the submitter's channel must be OK: {first}"
        );
        let second = rx.try_recv().expect("dispatched EVENT frame");
        assert!(
            second.contains("\"EVENT\""),
            "dispatch fan-out must follow OK: {second}"
        );
    }
}
