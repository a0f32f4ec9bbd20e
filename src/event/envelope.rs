//! Envelope metadata and CloudEvents conversions.
//!
//! Re-exports the cloudevents-sdk Event type and provides utilities for
//! building events from an envelope and decoding binary-mode messages.

use cloudevents::event::{AttributesReader, Data};
pub use cloudevents::Event as CloudEventEnvelope;
use cloudevents::{EventBuilder, EventBuilderV10};
use serde_json::Value;

use super::{EventError, Result};

/// Minimal metadata stamped on every outgoing event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub event_type: String,
    pub source: String,
}

impl Envelope {
    /// Fail unless id, type and source are all set.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EventError::InvalidEnvelope("id is empty".to_string()));
        }
        if self.event_type.is_empty() {
            return Err(EventError::InvalidEnvelope("type is empty".to_string()));
        }
        if self.source.is_empty() {
            return Err(EventError::InvalidEnvelope("source is empty".to_string()));
        }
        Ok(())
    }

    /// Build a CloudEvents 1.0 event carrying `data` as JSON.
    pub fn to_cloud_event(&self, data: Value) -> Result<CloudEventEnvelope> {
        self.validate()?;
        EventBuilderV10::envelope(&self.id, &self.event_type, &self.source)
            .time(chrono::Utc::now())
            .data("application/json", data)
            .build()
            .map_err(|e| EventError::InvalidEnvelope(e.to_string()))
    }
}

/// Extension for building CloudEvents from envelope metadata.
pub trait CloudEventBuilderExt {
    /// Create a new CloudEvents 1.0 builder with required fields.
    fn envelope(
        id: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> EventBuilderV10;
}

impl CloudEventBuilderExt for EventBuilderV10 {
    fn envelope(
        id: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> EventBuilderV10 {
        EventBuilderV10::new().id(id).ty(event_type).source(source)
    }
}

/// Raw bytes of an event's data, with its content type.
pub(crate) fn data_bytes(event: &CloudEventEnvelope) -> Result<(String, Vec<u8>)> {
    let content_type = event
        .datacontenttype()
        .unwrap_or("application/json")
        .to_string();
    let bytes = match event.data() {
        Some(Data::Json(value)) => serde_json::to_vec(value)?,
        Some(Data::String(s)) => s.clone().into_bytes(),
        Some(Data::Binary(b)) => b.clone(),
        None => Vec::new(),
    };
    Ok((content_type, bytes))
}

/// Decode a binary-mode event from prefixed attribute headers and a body.
///
/// HTTP uses the `ce-` prefix, Kafka uses `ce_`. Header names are matched
/// case-insensitively; unknown `ce` attributes become extensions.
pub(crate) fn decode_binary<'a, I>(
    prefix: &str,
    headers: I,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<CloudEventEnvelope>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut builder = EventBuilderV10::new();
    let mut seen_id = false;

    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        let Some(attr) = name.strip_prefix(prefix) else {
            continue;
        };
        let value = std::str::from_utf8(value)
            .map_err(|e| EventError::Decode(format!("header {}: {}", name, e)))?;

        builder = match attr {
            "id" => {
                seen_id = !value.is_empty();
                builder.id(value)
            }
            "type" => builder.ty(value),
            "source" => builder.source(value),
            "subject" => builder.subject(value),
            "time" => {
                let time = chrono::DateTime::parse_from_rfc3339(value)
                    .map_err(|e| EventError::Decode(format!("time: {}", e)))?;
                builder.time(time.with_timezone(&chrono::Utc))
            }
            "specversion" => {
                if value != "1.0" {
                    return Err(EventError::Decode(format!(
                        "unsupported specversion {}",
                        value
                    )));
                }
                builder
            }
            "dataschema" => builder,
            other => builder.extension(other, value.to_string()),
        };
    }

    if !seen_id {
        return Err(EventError::Decode("missing id attribute".to_string()));
    }

    if !body.is_empty() {
        let content_type = content_type.unwrap_or("application/json");
        builder = if content_type.contains("json") {
            let value: Value = serde_json::from_slice(body)?;
            builder.data(content_type, value)
        } else {
            builder.data(content_type, body.to_vec())
        };
    }

    builder
        .build()
        .map_err(|e| EventError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            id: "evt-1".to_string(),
            event_type: "order.created".to_string(),
            source: "urn:test".to_string(),
        }
    }

    #[test]
    fn test_to_cloud_event() {
        let event = envelope()
            .to_cloud_event(serde_json::json!({"order_id": "123"}))
            .unwrap();

        assert_eq!(event.specversion(), cloudevents::event::SpecVersion::V10);
        assert_eq!(event.id(), "evt-1");
        assert_eq!(event.ty(), "order.created");
        assert_eq!(event.source().to_string(), "urn:test");
        assert!(event.time().is_some());
        assert_eq!(
            event.data(),
            Some(&Data::Json(serde_json::json!({"order_id": "123"})))
        );
    }

    #[test]
    fn test_empty_type_rejected() {
        let mut env = envelope();
        env.event_type.clear();
        let result = env.to_cloud_event(Value::Null);
        assert!(matches!(result, Err(EventError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_empty_source_rejected() {
        let mut env = envelope();
        env.source.clear();
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_decode_binary_http_headers() {
        let headers: Vec<(&str, &[u8])> = vec![
            ("CE-ID", b"abc".as_slice()),
            ("ce-type", b"order.created".as_slice()),
            ("ce-source", b"urn:orders".as_slice()),
            ("ce-specversion", b"1.0".as_slice()),
            ("ce-tenant", b"acme".as_slice()),
            ("content-length", b"12".as_slice()),
        ];

        let event = decode_binary(
            "ce-",
            headers,
            Some("application/json"),
            br#"{"n":1}"#,
        )
        .unwrap();

        assert_eq!(event.id(), "abc");
        assert_eq!(event.ty(), "order.created");
        assert_eq!(event.source().to_string(), "urn:orders");
        assert_eq!(
            event.extension("tenant"),
            Some(&cloudevents::event::ExtensionValue::String("acme".to_string()))
        );
        assert_eq!(event.data(), Some(&Data::Json(serde_json::json!({"n": 1}))));
    }

    #[test]
    fn test_decode_binary_kafka_prefix_and_bytes() {
        let headers: Vec<(&str, &[u8])> = vec![
            ("ce_id", b"k-1".as_slice()),
            ("ce_type", b"t".as_slice()),
            ("ce_source", b"s".as_slice()),
        ];

        let event = decode_binary("ce_", headers, Some("text/plain"), b"hello").unwrap();
        assert_eq!(event.id(), "k-1");
        assert_eq!(event.data(), Some(&Data::Binary(b"hello".to_vec())));
    }

    #[test]
    fn test_decode_binary_requires_id() {
        let headers: Vec<(&str, &[u8])> = vec![("ce-type", b"t".as_slice())];
        let result = decode_binary("ce-", headers, None, b"");
        assert!(matches!(result, Err(EventError::Decode(_))));
    }

    #[test]
    fn test_data_bytes_json() {
        let event = envelope()
            .to_cloud_event(serde_json::json!({"a": true}))
            .unwrap();
        let (content_type, bytes) = data_bytes(&event).unwrap();
        assert_eq!(content_type, "application/json");
        assert_eq!(bytes, br#"{"a":true}"#.to_vec());
    }
}
