//! Observability counters. No external metrics backend is wired up here;
//! these are plain atomics periodically logged via `tracing` instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct Metrics {
    pub events_accepted: AtomicU64,
    pub events_rejected: Mutex<HashMap<&'static str, u64>>,
    pub subscriptions_live: AtomicU64,
    pub dispatch_drops: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason_prefix: &'static str) {
        let mut map = self.events_rejected.lock().expect("metrics lock poisoned");
        *map.entry(reason_prefix).or_insert(0) += 1;
    }

    pub fn subscription_opened(&self) {
        self.subscriptions_live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_closed(&self) {
        self.subscriptions_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_drop(&self) {
        self.dispatch_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Log a snapshot of all counters. Intended to be called from a
    /// periodic background task.
    pub fn log_snapshot(&self) {
        let rejected = self.events_rejected.lock().expect("metrics lock poisoned");
        tracing::info!(
            events_accepted = self.events_accepted.load(Ordering::Relaxed),
            events_rejected = ?*rejected,
            subscriptions_live = self.subscriptions_live.load(Ordering::Relaxed),
            dispatch_drops = self.dispatch_drops.load(Ordering::Relaxed),
            "relay metrics snapshot"
        );
    }
}
