//! Wire message classification and argument splitting.
//!
//! One JSON object per text frame. Field *presence* is what matters:
//! a frame without `id` is an event; a frame with `id` carries exactly one
//! of `method`/`result`/`error`, or none of them (a bare acknowledgement).
//!
//! An identifier of `0` is a valid identifier. Presence means "the field
//! exists and is not null", never "the value is truthy".

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// No identifier: fire-and-forget event, delivered to local listeners.
    Event(Value),
    /// Method invocation to be dispatched through the route resolver.
    Call {
        id: u64,
        method: String,
        params: Value,
    },
    /// Result for a pending outbound call.
    Result { id: u64, value: Value },
    /// Error for a pending outbound call. The payload is kept raw; the
    /// conventional shape is `{type, message}`.
    Error { id: u64, error: Value },
    /// Identifier but none of method/result/error: resolves the pending
    /// call with `null`.
    Ack { id: u64 },
}

impl Inbound {
    /// Classify a decoded frame payload.
    ///
    /// Precedence for frames carrying an identifier is `method`, then
    /// `result`, then `error`.
    pub fn classify(payload: Value) -> Result<Inbound, ProtocolError> {
        let Value::Object(mut map) = payload else {
            return Err(ProtocolError::NotAnObject);
        };

        let id = match map.get("id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| ProtocolError::InvalidId(v.clone()))?),
        };

        let Some(id) = id else {
            return Ok(Inbound::Event(Value::Object(map)));
        };

        if let Some(method) = map.remove("method") {
            let Value::String(method) = method else {
                return Err(ProtocolError::InvalidMethod(method));
            };
            let params = map.remove("params").unwrap_or(Value::Null);
            return Ok(Inbound::Call { id, method, params });
        }

        if let Some(value) = map.remove("result") {
            return Ok(Inbound::Result { id, value });
        }

        if let Some(error) = map.remove("error") {
            return Ok(Inbound::Error { id, error });
        }

        Ok(Inbound::Ack { id })
    }
}

/// The `{type, message}` body of an outbound error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

pub fn call_payload(id: u64, method: &str, params: &Value) -> Value {
    json!({ "id": id, "method": method, "params": params })
}

pub fn result_payload(id: u64, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

pub fn error_payload(id: u64, error: &ErrorFrame) -> Value {
    json!({ "id": id, "error": error })
}

/// Positional and keyword arguments split out of a `params` value.
///
/// The rule: `null` means no arguments, an array is positional, an object is
/// keyword, and any other scalar is a single positional argument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl Args {
    pub fn split(params: Value) -> Args {
        match params {
            Value::Null => Args::default(),
            Value::Array(items) => Args {
                positional: items,
                keyword: Map::new(),
            },
            Value::Object(map) => Args {
                positional: Vec::new(),
                keyword: map,
            },
            scalar => Args {
                positional: vec![scalar],
                keyword: Map::new(),
            },
        }
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_has_no_id() {
        let v = json!({"topic": "news", "data": 1});
        assert!(matches!(Inbound::classify(v).unwrap(), Inbound::Event(_)));
    }

    #[test]
    fn null_id_is_event() {
        let v = json!({"id": null, "method": "x"});
        assert!(matches!(Inbound::classify(v).unwrap(), Inbound::Event(_)));
    }

    #[test]
    fn zero_id_is_a_call() {
        let v = json!({"id": 0, "method": "ping", "params": null});
        match Inbound::classify(v).unwrap() {
            Inbound::Call { id, method, .. } => {
                assert_eq!(id, 0);
                assert_eq!(method, "ping");
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn method_wins_over_result() {
        let v = json!({"id": 3, "method": "m", "result": 1});
        assert!(matches!(
            Inbound::classify(v).unwrap(),
            Inbound::Call { id: 3, .. }
        ));
    }

    #[test]
    fn result_frame() {
        let v = json!({"id": 7, "result": {"pong": "pong"}});
        match Inbound::classify(v).unwrap() {
            Inbound::Result { id, value } => {
                assert_eq!(id, 7);
                assert_eq!(value, json!({"pong": "pong"}));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn false_result_is_still_a_result() {
        // `false`/`null` results must not degrade into acknowledgements.
        let v = json!({"id": 7, "result": false});
        assert!(matches!(
            Inbound::classify(v).unwrap(),
            Inbound::Result { id: 7, .. }
        ));
    }

    #[test]
    fn error_frame() {
        let v = json!({"id": 9, "error": {"type": "ValueError", "message": "bad"}});
        assert!(matches!(
            Inbound::classify(v).unwrap(),
            Inbound::Error { id: 9, .. }
        ));
    }

    #[test]
    fn bare_ack() {
        let v = json!({"id": 4});
        assert!(matches!(Inbound::classify(v).unwrap(), Inbound::Ack { id: 4 }));
    }

    #[test]
    fn rejects_non_object() {
        assert!(matches!(
            Inbound::classify(json!([1, 2])),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn rejects_bad_id() {
        assert!(matches!(
            Inbound::classify(json!({"id": "abc"})),
            Err(ProtocolError::InvalidId(_))
        ));
        assert!(matches!(
            Inbound::classify(json!({"id": -1})),
            Err(ProtocolError::InvalidId(_))
        ));
    }

    #[test]
    fn args_split_rule() {
        assert!(Args::split(Value::Null).is_empty());

        let a = Args::split(json!([1, 2]));
        assert_eq!(a.positional, vec![json!(1), json!(2)]);

        let a = Args::split(json!({"k": "v"}));
        assert_eq!(a.kwarg("k"), Some(&json!("v")));

        let a = Args::split(json!("solo"));
        assert_eq!(a.positional, vec![json!("solo")]);
    }

    #[test]
    fn error_frame_serializes_with_type_key() {
        let e = ErrorFrame {
            kind: "ValueError".into(),
            message: "bad".into(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v, json!({"type": "ValueError", "message": "bad"}));
    }
}
