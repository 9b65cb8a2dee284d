//! Admission as a pluggable predicate: no rate limiting, whitelist, or
//! proof-of-work policy is hardcoded here, so any deployment can supply its
//! own `AdmissionPolicy` implementation on top of the checks the ingestion
//! pipeline always performs.

use async_trait::async_trait;

use crate::model::Event;

#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    /// Whether this event may be admitted, independent of signature/replay
    /// checks which the ingestion pipeline always performs regardless.
    async fn allow_event(&self, event: &Event) -> bool;
}

/// The default: every structurally/cryptographically valid event is
/// admitted. Rate limiting, whitelists, and proof-of-work are layered on
/// top of this trait by a deployment that needs them.
pub struct AllowAll;

#[async_trait]
impl AdmissionPolicy for AllowAll {
    async fn allow_event(&self, _event: &Event) -> bool {
        true
    }
}
