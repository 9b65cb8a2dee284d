//! Per-connection auth state and the NIP-42-style challenge/response
//! handshake.

use crate::error::RelayError;
use crate::model::Event;

/// The "client auth" kind used by the NIP-42 handshake.
pub const AUTH_KIND: u16 = 22242;

/// Bound on how stale/future an AUTH event's `created_at` may be relative
/// to now.
const AUTH_TIME_WINDOW_SECS: i64 = 600;

#[derive(Debug, Default, Clone)]
pub struct AuthState {
    pub challenge: Option<String>,
    pub authed_pubkey: Option<String>,
    pub auth_required: bool,
    pub auth_requested: bool,
}

impl AuthState {
    pub fn new(auth_required: bool) -> Self {
        AuthState {
            challenge: None,
            authed_pubkey: None,
            auth_required,
            auth_requested: false,
        }
    }

    pub fn is_authed(&self) -> bool {
        self.authed_pubkey.is_some()
    }

    /// A fresh 16-byte random nonce, hex-encoded (stable within the
    /// connection; the exact encoding is not otherwise significant).
    pub fn issue_challenge(&mut self) -> String {
        let challenge = nanoid::nanoid!(32);
        self.challenge = Some(challenge.clone());
        self.auth_requested = true;
        challenge
    }

    /// Verify an AUTH response event against the outstanding challenge and
    /// this relay's service URL. On success, records
    /// `authed_pubkey`.
    pub fn handle_auth_event(
        &mut self,
        event: &Event,
        service_url: &str,
        now: i64,
    ) -> Result<(), RelayError> {
        if event.kind != AUTH_KIND {
            return Err(RelayError::MalformedFrame(format!(
                "AUTH event must be kind {AUTH_KIND}"
            )));
        }

        crate::model::codec::verify(event)?;

        let challenge = self
            .challenge
            .as_deref()
            .ok_or_else(|| RelayError::MalformedFrame("no challenge outstanding".into()))?;

        let tag_challenge = event.tag_value("challenge").ok_or_else(|| {
            RelayError::MalformedFrame("AUTH event missing challenge tag".into())
        })?;
        if tag_challenge != challenge {
            return Err(RelayError::MalformedFrame("challenge mismatch".into()));
        }

        let tag_relay = event
            .tag_value("relay")
            .ok_or_else(|| RelayError::MalformedFrame("AUTH event missing relay tag".into()))?;
        if !relay_url_matches(tag_relay, service_url) {
            return Err(RelayError::MalformedFrame("relay url mismatch".into()));
        }

        if (event.created_at - now).abs() > AUTH_TIME_WINDOW_SECS {
            return Err(RelayError::MalformedFrame(
                "AUTH event created_at out of window".into(),
            ));
        }

        self.authed_pubkey = Some(event.pubkey.clone());
        self.challenge = None;
        Ok(())
    }
}

/// Relay URLs are compared with trailing slashes normalized away.
fn relay_url_matches(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_kind() {
        let mut state = AuthState::new(true);
        state.issue_challenge();
        let event = Event {
            id: "0".repeat(64),
            pubkey: "0".repeat(64),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        };
        assert!(state.handle_auth_event(&event, "wss://relay", 0).is_err());
    }

    #[test]
    fn relay_url_normalizes_trailing_slash() {
        assert!(relay_url_matches("wss://relay.example/", "wss://relay.example"));
        assert!(!relay_url_matches("wss://other", "wss://relay.example"));
    }
}
