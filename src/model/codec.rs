//! Canonical serialization, id hashing, and signature verification.
//!
//! The id hash and signature check are security-critical and must match an
//! exact byte-level format, so the core owns them directly instead of
//! trusting an opaque dependency's escaping/error-classification choices.

use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::error::RelayError;
use crate::model::event::Event;

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

/// Escape a string per the Nostr canonical-JSON rules: only `\"`, `\\`,
/// `\n`, `\r`, `\t`, `\b`, `\f`, and `\u00XX` for other control bytes
/// 0x00-0x1F; everything else (including all non-ASCII UTF-8) passes through
/// byte-identical.
fn escape_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Build the bit-exact canonical array form:
/// `[0, pubkey_hex, created_at, kind, tags, content]`, no whitespace between
/// tokens, integers in shortest decimal.
pub fn canonical_json(event: &Event) -> String {
    let mut out = String::with_capacity(event.content.len() + 128);
    out.push('[');
    out.push('0');
    out.push(',');
    escape_json_string(&event.pubkey, &mut out);
    out.push(',');
    out.push_str(&event.created_at.to_string());
    out.push(',');
    out.push_str(&event.kind.to_string());
    out.push(',');
    out.push('[');
    for (i, tag) in event.tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, val) in tag.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            escape_json_string(val, &mut out);
        }
        out.push(']');
    }
    out.push(']');
    out.push(',');
    escape_json_string(&event.content, &mut out);
    out.push(']');
    out
}

/// SHA-256 of the canonical serialization.
pub fn canonical_id(event: &Event) -> [u8; 32] {
    let json = canonical_json(event);
    Sha256::digest(json.as_bytes()).into()
}

fn decode_hex32(hex_str: &str, field: &str) -> Result<[u8; 32], RelayError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| RelayError::MalformedFrame(format!("{field} is not valid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| RelayError::MalformedFrame(format!("{field} must be 32 bytes")))
}

fn decode_hex64(hex_str: &str, field: &str) -> Result<[u8; 64], RelayError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| RelayError::MalformedFrame(format!("{field} is not valid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| RelayError::MalformedFrame(format!("{field} must be 64 bytes")))
}

/// Recompute the id and verify the Schnorr signature. `BadId` and
/// `BadSignature` are distinct error kinds because they drive different
/// OK-response reason prefixes.
pub fn verify(event: &Event) -> Result<(), RelayError> {
    let recomputed = canonical_id(event);
    let declared = decode_hex32(&event.id, "id")?;
    if recomputed != declared {
        return Err(RelayError::BadId);
    }

    let pubkey_bytes = decode_hex32(&event.pubkey, "pubkey")?;
    let sig_bytes = decode_hex64(&event.sig, "sig")?;

    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| RelayError::BadSignature(format!("invalid pubkey: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| RelayError::BadSignature(format!("invalid signature encoding: {e}")))?;
    let msg = Message::from_digest(recomputed);

    secp()
        .verify_schnorr(&sig, &msg, &pubkey)
        .map_err(|e| RelayError::BadSignature(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event {
            id: String::new(),
            pubkey: "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798".into(),
            created_at: 100,
            kind: 1,
            tags: vec![vec!["e".into(), "abc".into()]],
            content: "hello \"world\"\n".into(),
            sig: "00".repeat(64),
        }
    }

    #[test]
    fn canonical_json_escapes_control_and_quote_chars() {
        let json = canonical_json(&sample());
        assert!(json.starts_with("[0,\"79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\",100,1,[[\"e\",\"abc\"]],\"hello \\\"world\\\"\\n\"]"));
        assert!(!json.contains(' '));
    }

    #[test]
    fn bad_id_is_distinct_from_bad_signature() {
        let mut e = sample();
        e.id = "00".repeat(32);
        let err = verify(&e).unwrap_err();
        assert!(matches!(err, RelayError::BadId));

        let recomputed = canonical_id(&e);
        e.id = hex::encode(recomputed);
        let err = verify(&e).unwrap_err();
        assert!(matches!(err, RelayError::BadSignature(_)));
    }
}
