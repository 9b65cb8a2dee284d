//! Inbound envelope recognition and parsing: each inbound frame
//! is one JSON array whose first element is a tag.

use crate::error::RelayError;
use crate::model::{Event, Filter};

pub enum ClientFrame {
    Event(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Close(String),
    Auth(Event),
    /// A structurally valid array whose tag the core does not recognize.
    /// Yields a NOTICE but never terminates the connection.
    Unsupported(String),
}

pub fn parse(
    text: &str,
    max_filters_per_req: usize,
    max_limit: usize,
) -> Result<ClientFrame, RelayError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RelayError::MalformedFrame(format!("not valid JSON: {e}")))?;

    let arr = value
        .as_array()
        .ok_or_else(|| RelayError::MalformedFrame("frame must be a JSON array".into()))?;

    let tag = arr
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayError::MalformedFrame("frame missing a string tag".into()))?;

    match tag {
        "EVENT" => {
            let event_value = arr
                .get(1)
                .ok_or_else(|| RelayError::MalformedFrame("EVENT frame missing event".into()))?;
            let event: Event = serde_json::from_value(event_value.clone())?;
            Ok(ClientFrame::Event(event))
        }
        "REQ" => {
            let sub_id = arr
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(|| RelayError::MalformedFrame("REQ frame missing sub_id".into()))?
                .to_string();
            let filter_values = &arr[2.min(arr.len())..];
            let filters = Filter::parse_all(filter_values, max_filters_per_req, max_limit)?;
            Ok(ClientFrame::Req { sub_id, filters })
        }
        "CLOSE" => {
            let sub_id = arr
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(|| RelayError::MalformedFrame("CLOSE frame missing sub_id".into()))?
                .to_string();
            Ok(ClientFrame::Close(sub_id))
        }
        "AUTH" => {
            let event_value = arr
                .get(1)
                .ok_or_else(|| RelayError::MalformedFrame("AUTH frame missing event".into()))?;
            let event: Event = serde_json::from_value(event_value.clone())?;
            Ok(ClientFrame::Auth(event))
        }
        other => Ok(ClientFrame::Unsupported(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_req_with_multiple_filters() {
        let text = r#"["REQ","s1",{"kinds":[1]},{"kinds":[2]}]"#;
        match parse(text, 10, 500).unwrap() {
            ClientFrame::Req { sub_id, filters } => {
                assert_eq!(sub_id, "s1");
                assert_eq!(filters.len(), 2);
            }
            _ => panic!("expected Req"),
        }
    }

    #[test]
    fn unrecognized_tag_is_unsupported_not_an_error() {
        let text = r#"["NEG-OPEN","s1"]"#;
        match parse(text, 10, 500).unwrap() {
            ClientFrame::Unsupported(tag) => assert_eq!(tag, "NEG-OPEN"),
            _ => panic!("expected Unsupported"),
        }
    }

    #[test]
    fn non_array_frame_is_malformed() {
        let err = parse(r#"{"foo":"bar"}"#, 10, 500).unwrap_err();
        assert!(matches!(err, RelayError::MalformedFrame(_)));
    }
}
