//! Subscription registry: concurrent mapping from connection
//! identity to sub_id -> filter set, plus event fan-out.
//!
//! The registry holds a *keyed handle* to each connection (its outbound
//! sender, addressed by a connection id), never a back-pointer into the
//! connection itself -- so there is no ownership cycle between a
//! subscription and its connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::metrics::Metrics;
use crate::model::{matcher, Event, Filter};

pub type ConnId = u64;

#[derive(Debug, Clone)]
pub struct SubEntry {
    pub filters: Vec<Filter>,
    pub overflowed: bool,
}

struct ConnHandle {
    sender: mpsc::Sender<String>,
    subs: Mutex<HashMap<String, SubEntry>>,
}

/// Sharded by connection identity: the outer map is guarded by a single
/// `RwLock` (enumerated with a read lock by `dispatch`), but each
/// connection's own subscription map is behind its own `Mutex`, so enqueuing
/// to one connection never blocks fan-out to any other.
pub struct Registry {
    conns: RwLock<HashMap<ConnId, Arc<ConnHandle>>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Registry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Registry {
            conns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register_connection(&self, conn_id: ConnId, sender: mpsc::Sender<String>) {
        let handle = Arc::new(ConnHandle {
            sender,
            subs: Mutex::new(HashMap::new()),
        });
        self.conns.write().await.insert(conn_id, handle);
    }

    /// Replaces any prior subscription with the same (conn, sub_id).
    pub async fn add(&self, conn_id: ConnId, sub_id: String, filters: Vec<Filter>) {
        let conns = self.conns.read().await;
        if let Some(handle) = conns.get(&conn_id) {
            let mut subs = handle.subs.lock().await;
            let replaced = subs
                .insert(
                    sub_id,
                    SubEntry {
                        filters,
                        overflowed: false,
                    },
                )
                .is_some();
            if !replaced {
                self.metrics.subscription_opened();
            }
        }
    }

    /// Idempotent.
    pub async fn remove(&self, conn_id: ConnId, sub_id: &str) {
        let conns = self.conns.read().await;
        if let Some(handle) = conns.get(&conn_id) {
            let mut subs = handle.subs.lock().await;
            if subs.remove(sub_id).is_some() {
                self.metrics.subscription_closed();
            }
        }
    }

    /// Called on connection teardown.
    pub async fn remove_all(&self, conn_id: ConnId) {
        let mut conns = self.conns.write().await;
        if let Some(handle) = conns.remove(&conn_id) {
            let count = handle.subs.lock().await.len();
            for _ in 0..count {
                self.metrics.subscription_closed();
            }
        }
    }

    /// For each (conn, sub_id, filters) pair, if the event matches, enqueue
    /// it to that connection's writer. Dispatch across different
    /// connections is independent and unordered relative to each other;
    /// within one connection's writer, events appear in the order the
    /// dispatcher handed them in.
    pub async fn dispatch(&self, event: &Event) {
        let conns = self.conns.read().await;
        for handle in conns.values() {
            let mut subs = handle.subs.lock().await;
            for (sub_id, entry) in subs.iter_mut() {
                if !matcher::matches_any(&entry.filters, event) {
                    continue;
                }
                if entry.overflowed {
                    let notice = serde_json::json!([
                        "NOTICE",
                        format!("subscription {sub_id} dropped events due to backpressure")
                    ])
                    .to_string();
                    if handle.sender.try_send(notice).is_ok() {
                        entry.overflowed = false;
                    }
                }
                let payload = serde_json::json!(["EVENT", sub_id, event_to_json(event)]).to_string();
                if handle.sender.try_send(payload).is_err() {
                    entry.overflowed = true;
                    self.metrics.record_dispatch_drop();
                }
            }
        }
    }
}

fn event_to_json(event: &Event) -> serde_json::Value {
    serde_json::to_value(event).unwrap_or(serde_json::Value::Null)
}
