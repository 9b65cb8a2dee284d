//! Per-connection reader/writer orchestration.
//!
//! Exclusive ownership of the write half: a single writer task owns the
//! split sink and is reached only through a bounded channel. The reader
//! task owns auth state and the connection's own subscription bookkeeping
//! and is never contended by any other task.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::admission::AdmissionPolicy;
use crate::auth::AuthState;
use crate::config::Config;
use crate::ingest::{handle_event, IngestContext};
use crate::metrics::Metrics;
use crate::query::{handle_close, handle_req, QueryContext};
use crate::registry::Registry;
use crate::store::Store;
use crate::ws::envelope::{self, ClientFrame};

/// Drives one upgraded WebSocket for its entire lifetime. Returns once the
/// connection is torn down; the registry's subscriptions for it are always
/// cleaned up before returning.
pub async fn run<S: Store + ?Sized>(
    socket: WebSocket,
    store: &S,
    registry: &Registry,
    metrics: &Metrics,
    admission: &dyn AdmissionPolicy,
    config: &Config,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let conn_id = registry.next_conn_id();
    let (tx, mut rx) = mpsc::channel::<String>(config.outbound_queue_capacity);
    registry.register_connection(conn_id, tx.clone()).await;

    let ping_interval_secs = config.ping_interval_secs;
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(ping_interval_secs));
        ping_interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut auth = AuthState::new(config.auth_required);

    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    loop {
        let next = tokio::time::timeout(idle_timeout, ws_stream.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                tracing::warn!(conn_id, error = %e, "websocket read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(conn_id, "connection idle timeout");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_text_frame(
                    &text,
                    conn_id,
                    store,
                    registry,
                    metrics,
                    admission,
                    config,
                    &mut auth,
                    &tx,
                )
                .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    registry.remove_all(conn_id).await;
    writer.abort();
}

#[allow(clippy::too_many_arguments)]
async fn handle_text_frame<S: Store + ?Sized>(
    text: &str,
    conn_id: crate::registry::ConnId,
    store: &S,
    registry: &Registry,
    metrics: &Metrics,
    admission: &dyn AdmissionPolicy,
    config: &Config,
    auth: &mut AuthState,
    tx: &mpsc::Sender<String>,
) {
    let frame = match envelope::parse(text, config.max_filters_per_req, config.max_limit) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = tx
                .send(serde_json::json!(["NOTICE", e.reason()]).to_string())
                .await;
            return;
        }
    };

    match frame {
        ClientFrame::Event(event) => {
            let mut ctx = IngestContext {
                store,
                registry,
                metrics,
                admission,
                auth,
                config,
                tx,
            };
            for out in handle_event(event, &mut ctx).await {
                let _ = tx.send(out).await;
            }
        }
        ClientFrame::Req { sub_id, filters } => {
            let mut ctx = QueryContext {
                store,
                registry,
                admission,
                auth,
                config,
                conn_id,
            };
            for out in handle_req(sub_id, filters, &mut ctx).await {
                let _ = tx.send(out).await;
            }
        }
        ClientFrame::Close(sub_id) => {
            handle_close(registry, conn_id, &sub_id).await;
        }
        ClientFrame::Auth(event) => {
            let now = now_secs();
            let reply = match auth.handle_auth_event(&event, &config.service_url, now) {
                Ok(()) => serde_json::json!(["OK", event.id, true, ""]).to_string(),
                Err(e) => serde_json::json!(["OK", event.id, false, e.reason()]).to_string(),
            };
            let _ = tx.send(reply).await;
        }
        ClientFrame::Unsupported(tag) => {
            let _ = tx
                .send(serde_json::json!(["NOTICE", format!("unsupported frame tag: {tag}")]).to_string())
                .await;
        }
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
