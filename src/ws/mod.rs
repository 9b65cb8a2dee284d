//! WebSocket framing & envelopes: the axum entry point, request
//! routing between the WS upgrade and the (out-of-scope) relay-info path,
//! and per-connection orchestration.

pub mod connection;
pub mod envelope;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::admission::AdmissionPolicy;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::store::Store;

/// Everything a connection handler needs, held behind `Arc` so an axum
/// route closure (which must be `'static`) can clone it cheaply per upgrade.
#[derive(Clone)]
pub struct RelayState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
    pub admission: Arc<dyn AdmissionPolicy>,
    pub config: Arc<Config>,
}

/// Routes an upgrade request to the WS handler, and a relay-info request
/// (`Accept: application/nostr+json`, NIP-11 -- out of scope) to a minimal
/// placeholder so the same path can still serve browsers.
pub async fn handler(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(state): State<RelayState>,
) -> Response {
    if let Some(ws) = ws {
        return ws
            .on_upgrade(move |socket| async move {
                connection::run(
                    socket,
                    state.store.as_ref(),
                    state.registry.as_ref(),
                    state.metrics.as_ref(),
                    state.admission.as_ref(),
                    state.config.as_ref(),
                )
                .await;
            })
            .into_response();
    }

    if headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/nostr+json"))
    {
        return "relay information document not served by this endpoint".into_response();
    }

    "nostr relay".into_response()
}
