//! JSON batch codec for the Bayeux wire format.
//!
//! A batch on the wire is a JSON array of messages; a lone message object is
//! accepted as a batch of one. Replies are always written as arrays.

use crate::error::{CometError, CometResult};
use crate::message::Message;
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum Batch {
    Many(Vec<Message>),
    One(Box<Message>),
}

/// Decode a request body into an ordered batch of messages.
pub fn batch_decode(data: &[u8]) -> CometResult<Vec<Message>> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match serde_json::from_slice::<Batch>(data)? {
        Batch::Many(messages) => Ok(messages),
        Batch::One(message) => Ok(vec![*message]),
    }
}

/// Encode a reply batch as a JSON array.
pub fn batch_encode(messages: &[Message]) -> CometResult<Vec<u8>> {
    Ok(serde_json::to_vec(messages)?)
}

/// Encode a reply batch wrapped in a JSONP callback invocation.
pub fn jsonp_encode(callback: &str, messages: &[Message]) -> CometResult<Vec<u8>> {
    if !is_valid_callback(callback) {
        return Err(CometError::InvalidMessage(format!(
            "invalid jsonp callback: {callback}"
        )));
    }
    let body = batch_encode(messages)?;
    let mut out = Vec::with_capacity(callback.len() + body.len() + 2);
    out.extend_from_slice(callback.as_bytes());
    out.push(b'(');
    out.extend(body);
    out.push(b')');
    Ok(out)
}

/// Callback names are restricted to dotted JavaScript identifiers.
pub fn is_valid_callback(callback: &str) -> bool {
    !callback.is_empty()
        && callback
            .split('.')
            .all(|part| {
                let mut chars = part.chars();
                matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
            })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_array_batch_in_order() {
        let body = br#"[{"channel":"/meta/handshake"},{"channel":"/meta/connect","clientId":"c"}]"#;
        let batch = batch_decode(body).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].channel, "/meta/handshake");
        assert_eq!(batch[1].client_id.as_deref(), Some("c"));
    }

    #[test]
    fn decodes_single_object_as_batch_of_one() {
        let batch = batch_decode(br#"{"channel":"/chat","data":{"foo":"bar"}}"#).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data, Some(json!({"foo": "bar"})));
    }

    #[test]
    fn empty_body_is_empty_batch() {
        assert!(batch_decode(b"  ").unwrap().is_empty());
    }

    #[test]
    fn rejects_message_without_channel() {
        let err = batch_decode(br#"[{"clientId":"x"}]"#).unwrap_err();
        assert!(matches!(err, CometError::Codec(_)));
    }

    #[test]
    fn jsonp_wraps_array() {
        let out = jsonp_encode("jQuery.cb_1", &[Message::new("/a")]).unwrap();
        assert_eq!(out, br#"jQuery.cb_1([{"channel":"/a"}])"#);
    }

    #[test]
    fn jsonp_rejects_script_injection() {
        assert!(jsonp_encode("alert(1);cb", &[]).is_err());
        assert!(jsonp_encode("", &[]).is_err());
    }
}
