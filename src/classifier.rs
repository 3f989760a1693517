//! C1 — Event Classifier: turns one `RawEvent` into exactly one
//! `ClassifiedEvent` (valid `BulkItem` or `InvalidItem`). Pure function, no
//! I/O, so it is trivially unit-testable in isolation (§4.1).

use crate::models::{BulkItem, ClassifiedEvent, InvalidItem, RawEvent};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub fn classify(raw: &RawEvent) -> ClassifiedEvent {
    match try_classify(raw) {
        Ok(item) => ClassifiedEvent::Valid(item),
        Err(reason) => ClassifiedEvent::Invalid(invalid_item(raw, reason)),
    }
}

fn invalid_item(raw: &RawEvent, reason: String) -> InvalidItem {
    let doc_id = raw
        .string_property("MessageId")
        .ok()
        .flatten()
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let timestamp = raw
        .string_property("Timestamp")
        .ok()
        .flatten()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);
    let body = String::from_utf8_lossy(&raw.body).into_owned();
    InvalidItem {
        doc_id,
        timestamp,
        enqueue_time: raw.enqueued_at,
        body,
        invalid_reason: reason,
    }
}

fn try_classify(raw: &RawEvent) -> Result<BulkItem, String> {
    let type_attr = raw
        .string_property("Type")
        .map_err(|f| format!("Invalid value for field: {f}"))?;
    let message_id_attr = raw
        .string_property("MessageId")
        .map_err(|f| format!("Invalid value for field: {f}"))?;
    let timestamp_attr = raw
        .string_property("Timestamp")
        .map_err(|f| format!("Invalid value for field: {f}"))?;
    let source_attr = raw
        .string_property("Source")
        .map_err(|f| format!("Invalid value for field: {f}"))?;

    let body = String::from_utf8(raw.body.clone()).map_err(|_| "Invalid UTF-8 body".to_string())?;

    let doc_id = message_id_attr
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut timestamp = timestamp_attr
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    let type_present = type_attr.filter(|t| !t.is_empty());
    let (index_base, doc_type, flat): (String, String, bool) = if let Some(t) = type_present {
        match t {
            "SerilogEvent" => ("logstash".to_string(), "logevent".to_string(), false),
            "RoboCustosInteraction" => (
                "robointeractions".to_string(),
                "interaction".to_string(),
                false,
            ),
            "ExternalTelemetry" => (
                "externaltelemetry".to_string(),
                source_attr.unwrap_or("telemetryevent").to_string(),
                false,
            ),
            "azure-resources" => (
                "azure-resources".to_string(),
                source_attr.unwrap_or("metadata").to_string(),
                true,
            ),
            _ => return Err("Missing or invalid Type".to_string()),
        }
    } else {
        match infer_serilog_timestamp(&body) {
            Some(inferred_ts) => {
                timestamp = inferred_ts;
                ("logstash".to_string(), "logevent".to_string(), false)
            }
            None => return Err("Missing or invalid Type".to_string()),
        }
    };

    BulkItem::new(
        index_base,
        doc_type,
        doc_id,
        timestamp,
        raw.enqueued_at,
        body,
        flat,
    )
    .map_err(|e| e.to_string())
}

/// The classifier's only attribute timestamp format is ISO-8601 / RFC3339,
/// matching the `@timestamp` format used for body inference below.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Implicit-`SerilogEvent` body inference (§4.1 step 3): an object with
/// `message` (string), `messageTemplate` (string), and `@timestamp`
/// (ISO-8601 string) is treated as a Serilog event even without a `Type`.
fn infer_serilog_timestamp(body: &str) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let obj = value.as_object()?;
    obj.get("message")?.as_str()?;
    obj.get("messageTemplate")?.as_str()?;
    let ts = obj.get("@timestamp")?.as_str()?;
    parse_timestamp(ts)
}
