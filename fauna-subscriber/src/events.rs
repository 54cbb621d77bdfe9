//! The event model: typed stream events and the pure classifier mapping a
//! decoded push frame onto exactly one of them.

use std::sync::Arc;

use serde_json::Value;

use crate::types::{Error, RequestResult};

/// Tag identifying a stream event variant. Consumers switch on the tag
/// rather than on the concrete payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Start,
    Error,
    Version,
    HistoryRewrite,
    Unknown,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Error => "error",
            EventType::Version => "version",
            EventType::HistoryRewrite => "history_rewrite",
            EventType::Unknown => "unknown",
        }
    }
}

/// A stream error, normalized from both server-reported protocol errors and
/// client-side transport or decode failures.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: Value,
    pub code: Option<String>,
    pub description: Option<String>,
}

impl ErrorEvent {
    /// Extraction rule for an `"error"`-discriminated frame: `data` wins (and
    /// supplies `code`/`description` when it is a mapping), then `errors`,
    /// then the whole payload.
    fn from_payload(parsed: &Value) -> Self {
        if let Some(data) = parsed.get("data") {
            Self {
                error: data.clone(),
                code: str_field(data, "code"),
                description: str_field(data, "description"),
            }
        } else if let Some(errors) = parsed.get("errors") {
            Self {
                error: errors.clone(),
                code: None,
                description: None,
            }
        } else {
            Self {
                error: parsed.clone(),
                code: None,
                description: None,
            }
        }
    }

    /// A bad-request-style failure: a frame carrying an `errors` key with no
    /// discriminator. The `error` field is the `errors` value itself.
    fn from_errors(parsed: &Value) -> Self {
        let errors = parsed.get("errors").cloned().unwrap_or(Value::Null);
        let first = errors.get(0);
        Self {
            code: first.and_then(|e| str_field(e, "code")),
            description: first.and_then(|e| str_field(e, "description")),
            error: errors,
        }
    }

    /// A client-side failure (transport drop, malformed frame) terminating
    /// the receive loop.
    pub(crate) fn from_failure(failure: &Error) -> Self {
        Self {
            error: Value::String(failure.to_string()),
            code: None,
            description: None,
        }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

/// One event on a stream subscription.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Always the first event on a stream; every later event carries a
    /// transaction timestamp greater than or equal to this one's.
    Start { data: Value, txn_ts: i64 },
    /// A state change of the subscribed query result.
    Version {
        data: Option<Value>,
        txn_ts: Option<i64>,
    },
    /// The subscribed document's history was altered retroactively.
    HistoryRewrite {
        data: Option<Value>,
        txn_ts: Option<i64>,
    },
    /// Client-side and server-side failures, normalized.
    Error(ErrorEvent),
    /// Fallback for unparseable payloads and unrecognized discriminators;
    /// carries the original request result for diagnostics.
    Unknown { raw: Arc<RequestResult> },
}

impl StreamEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            StreamEvent::Start { .. } => EventType::Start,
            StreamEvent::Version { .. } => EventType::Version,
            StreamEvent::HistoryRewrite { .. } => EventType::HistoryRewrite,
            StreamEvent::Error(_) => EventType::Error,
            StreamEvent::Unknown { .. } => EventType::Unknown,
        }
    }

    /// The event's transaction timestamp, when it carries one.
    pub fn txn_ts(&self) -> Option<i64> {
        match self {
            StreamEvent::Start { txn_ts, .. } => Some(*txn_ts),
            StreamEvent::Version { txn_ts, .. } | StreamEvent::HistoryRewrite { txn_ts, .. } => {
                *txn_ts
            }
            StreamEvent::Error(_) | StreamEvent::Unknown { .. } => None,
        }
    }
}

/// Classifies one request result into exactly one stream event.
///
/// Precedence, checked in order: absent payload, `"start"`, bare `errors` key
/// with no discriminator, `"error"`, `"version"`, `"history_rewrite"`,
/// anything else. The function is pure: re-classifying the same request
/// result always yields an identical event.
///
/// A `start` frame missing its required `data`/`txnTS` fields is a
/// malformed-frame error; the receive loop treats that like any other
/// client-side decode failure and terminates the stream.
pub fn classify(request_result: &Arc<RequestResult>) -> Result<StreamEvent, Error> {
    let Some(parsed) = &request_result.parsed else {
        return Ok(StreamEvent::Unknown {
            raw: Arc::clone(request_result),
        });
    };

    let event = match parsed.get("event") {
        Some(Value::String(tag)) if tag == "start" => {
            let data = parsed
                .get("data")
                .cloned()
                .ok_or_else(|| Error::MalformedFrame("start event missing data".into()))?;
            let txn_ts = parsed
                .get("txnTS")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::MalformedFrame("start event missing txnTS".into()))?;
            StreamEvent::Start { data, txn_ts }
        }
        None if parsed.get("errors").is_some() => {
            StreamEvent::Error(ErrorEvent::from_errors(parsed))
        }
        Some(Value::String(tag)) if tag == "error" => {
            StreamEvent::Error(ErrorEvent::from_payload(parsed))
        }
        Some(Value::String(tag)) if tag == "version" => StreamEvent::Version {
            data: parsed.get("data").cloned(),
            txn_ts: parsed.get("txnTS").and_then(Value::as_i64),
        },
        Some(Value::String(tag)) if tag == "history_rewrite" => StreamEvent::HistoryRewrite {
            data: parsed.get("data").cloned(),
            txn_ts: parsed.get("txnTS").and_then(Value::as_i64),
        },
        _ => StreamEvent::Unknown {
            raw: Arc::clone(request_result),
        },
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use std::time::SystemTime;

    fn request_result(raw: &str) -> Arc<RequestResult> {
        let now = SystemTime::now();
        Arc::new(RequestResult {
            method: "POST",
            path: "/stream".into(),
            query: serde_json::json!({"@ref": {"id": "1"}}),
            request_body: Bytes::from_static(b"{}"),
            raw_chunk: raw.to_string(),
            parsed: serde_json::from_str(raw).ok(),
            headers: HeaderMap::new(),
            start_time: now,
            end_time: now,
        })
    }

    #[test]
    fn absent_payload_is_unknown() {
        let rr = request_result("not json");
        match classify(&rr).unwrap() {
            StreamEvent::Unknown { raw } => assert_eq!(raw.raw_chunk, "not json"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn start_event() {
        let rr = request_result(r#"{"event":"start","data":{"@ts":"2020"},"txnTS":100}"#);
        match classify(&rr).unwrap() {
            StreamEvent::Start { data, txn_ts } => {
                assert_eq!(txn_ts, 100);
                assert_eq!(data, serde_json::json!({"@ts": "2020"}));
            }
            other => panic!("expected Start, got {other:?}"),
        }
    }

    #[test]
    fn start_missing_fields_is_malformed() {
        let rr = request_result(r#"{"event":"start"}"#);
        match classify(&rr) {
            Err(Error::MalformedFrame(msg)) => assert!(msg.contains("data"), "got: {msg}"),
            other => panic!("expected MalformedFrame, got {other:?}"),
        }
        let rr = request_result(r#"{"event":"start","data":{}}"#);
        assert!(matches!(classify(&rr), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn bare_errors_key_is_error_event() {
        let rr = request_result(
            r#"{"errors":[{"code":"invalid expression","description":"Write effect in read-only query expression."}]}"#,
        );
        match classify(&rr).unwrap() {
            StreamEvent::Error(err) => {
                assert_eq!(
                    err.error,
                    rr.parsed.as_ref().unwrap().get("errors").cloned().unwrap()
                );
                assert_eq!(err.code.as_deref(), Some("invalid expression"));
                assert_eq!(
                    err.description.as_deref(),
                    Some("Write effect in read-only query expression.")
                );
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn errors_key_with_discriminator_follows_discriminator() {
        // Rule precedence: a present discriminator wins over the bare-errors rule.
        let rr = request_result(r#"{"event":"version","errors":[],"txnTS":7}"#);
        assert!(matches!(
            classify(&rr).unwrap(),
            StreamEvent::Version { txn_ts: Some(7), .. }
        ));
    }

    #[test]
    fn error_event_code_and_description_from_data() {
        let rr = request_result(
            r#"{"event":"error","data":{"code":"permission denied","description":"Authorization lost during stream evaluation."}}"#,
        );
        match classify(&rr).unwrap() {
            StreamEvent::Error(err) => {
                assert_eq!(err.code.as_deref(), Some("permission denied"));
                assert_eq!(
                    err.description.as_deref(),
                    Some("Authorization lost during stream evaluation.")
                );
                assert_eq!(
                    err.error,
                    serde_json::json!({"code":"permission denied","description":"Authorization lost during stream evaluation."})
                );
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn error_event_falls_back_to_errors_then_whole_payload() {
        let rr = request_result(r#"{"event":"error","errors":["boom"]}"#);
        match classify(&rr).unwrap() {
            StreamEvent::Error(err) => {
                assert_eq!(err.error, serde_json::json!(["boom"]));
                assert!(err.code.is_none());
            }
            other => panic!("expected Error, got {other:?}"),
        }

        let rr = request_result(r#"{"event":"error","reason":"?"}"#);
        match classify(&rr).unwrap() {
            StreamEvent::Error(err) => {
                assert_eq!(err.error, serde_json::json!({"event":"error","reason":"?"}));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn version_and_history_rewrite_events() {
        let rr = request_result(r#"{"event":"version","data":{"new":{"n":1}},"txnTS":105}"#);
        match classify(&rr).unwrap() {
            StreamEvent::Version { data, txn_ts } => {
                assert_eq!(txn_ts, Some(105));
                assert_eq!(data, Some(serde_json::json!({"new": {"n": 1}})));
            }
            other => panic!("expected Version, got {other:?}"),
        }

        let rr = request_result(r#"{"event":"history_rewrite","txnTS":110}"#);
        match classify(&rr).unwrap() {
            StreamEvent::HistoryRewrite { data, txn_ts } => {
                assert_eq!(txn_ts, Some(110));
                assert!(data.is_none());
            }
            other => panic!("expected HistoryRewrite, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_discriminator_is_unknown() {
        let rr = request_result(r#"{"event":"snapshot","data":{}}"#);
        assert!(matches!(
            classify(&rr).unwrap(),
            StreamEvent::Unknown { .. }
        ));
        // Non-string discriminators are not recognized either.
        let rr = request_result(r#"{"event":42,"errors":[]}"#);
        assert!(matches!(
            classify(&rr).unwrap(),
            StreamEvent::Unknown { .. }
        ));
    }

    #[test]
    fn classification_is_idempotent() {
        let rr = request_result(r#"{"event":"version","data":{"new":{}},"txnTS":9}"#);
        let first = format!("{:?}", classify(&rr).unwrap());
        let second = format!("{:?}", classify(&rr).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn event_type_tags() {
        assert_eq!(EventType::Start.as_str(), "start");
        assert_eq!(EventType::HistoryRewrite.as_str(), "history_rewrite");
        let rr = request_result(r#"{"event":"version"}"#);
        assert_eq!(classify(&rr).unwrap().event_type(), EventType::Version);
    }
}
