//! Classification of decoded JSON records.

use serde_json::Value;
use surge_common::metrics::MetricsPayload;

/// One classified framing unit. Created per record, consumed immediately
/// by the aggregator, discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Status(String),
    Content(String),
    Metrics(MetricsPayload),
    Terminal(Option<MetricsPayload>),
}

/// Priority-ordered classification; first match wins.
///
/// The metrics-typed check runs before the done-check on purpose: some
/// producers emit metrics as a separate event ahead of the terminal
/// signal, others embed them in the terminal record. Either way the
/// payload must not be missed.
pub fn classify(value: &Value) -> Record {
    if value.get("type").and_then(Value::as_str) == Some("metrics") && has_resource_delta(value) {
        if let Ok(payload) = serde_json::from_value::<MetricsPayload>(value.clone()) {
            return Record::Metrics(payload);
        }
    }

    if value.get("done").and_then(Value::as_bool) == Some(true) {
        let embedded = if has_resource_delta(value) {
            serde_json::from_value::<MetricsPayload>(value.clone()).ok()
        } else {
            None
        };
        return Record::Terminal(embedded);
    }

    if let Some(content) = value
        .pointer("/message/content")
        .or_else(|| value.get("content"))
        .and_then(Value::as_str)
    {
        return Record::Content(content.to_string());
    }

    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Record::Status(message.to_string())
}

fn has_resource_delta(value: &Value) -> bool {
    value
        .get("resource_delta")
        .and_then(Value::as_object)
        .map(|obj| !obj.is_empty())
        .unwrap_or(false)
}
