//! Turns raw queue messages into validated `AdRequestEvent`s.
//!
//! Decoding is a pure transform: it never touches I/O and never panics on input.
//! Fields are read one by one from an untyped JSON object so that a rejection can
//! name the exact field at fault.
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{ValidationError, ValidationReason};
use crate::event::{AdCandidate, AdContext, AdRequestEvent, RawMessage};

const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Debug, Clone)]
pub struct Decoder {
    /// Largest accepted distance, in either direction, between an event timestamp and
    /// the moment the message reached the queue.
    max_timestamp_skew: chrono::Duration,
}

impl Decoder {
    pub fn new(max_timestamp_skew: chrono::Duration) -> Self {
        Self { max_timestamp_skew }
    }

    /// Decode and validate one message.
    ///
    /// The skew check measures against `message.received_at`, falling back to `now`
    /// for messages that carry no receive time.
    pub fn decode(
        &self,
        message: &RawMessage,
        now: DateTime<Utc>,
    ) -> Result<AdRequestEvent, ValidationError> {
        let body: Value = serde_json::from_str(&message.body).map_err(|e| {
            ValidationError::new("body", ValidationReason::MalformedJson(e.to_string()))
        })?;
        let object = body
            .as_object()
            .ok_or_else(|| ValidationError::new("body", ValidationReason::WrongType("object")))?;

        let event_id = match field(object, "opportunity_id") {
            Some(_) => required_id(object, "opportunity_id", "opportunity_id")?,
            None => required_id(object, "request_id", "opportunity_id")?,
        };

        let timestamp = required(object, "timestamp", "timestamp", coerce_timestamp)?;
        self.check_skew(timestamp, message.received_at.unwrap_or(now))?;

        let context = AdContext {
            user_id: optional(object, "user_id", "user_id", coerce_id)?,
            content_category: required(
                object,
                "content_category",
                "content_category",
                coerce_label,
            )?,
            device_type: optional(object, "device_type", "device_type", coerce_label)?
                .unwrap_or_else(|| UNKNOWN_DEVICE.to_owned()),
            region: optional(object, "region", "region", coerce_label)?,
        };

        let bids = field(object, "bids")
            .ok_or_else(|| ValidationError::new("bids", ValidationReason::Missing))?
            .as_array()
            .ok_or_else(|| ValidationError::new("bids", ValidationReason::WrongType("array")))?;

        let candidates = bids
            .iter()
            .enumerate()
            .map(|(index, bid)| decode_candidate(index, bid))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AdRequestEvent {
            event_id,
            timestamp,
            context,
            candidates,
        })
    }

    fn check_skew(
        &self,
        timestamp: DateTime<Utc>,
        reference: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let skew = (reference - timestamp).abs();

        if skew > self.max_timestamp_skew {
            return Err(ValidationError::new(
                "timestamp",
                ValidationReason::OutsideSkewWindow {
                    skew_seconds: skew.num_seconds(),
                    max_skew_seconds: self.max_timestamp_skew.num_seconds(),
                },
            ));
        }

        Ok(())
    }
}

fn decode_candidate(index: usize, bid: &Value) -> Result<AdCandidate, ValidationError> {
    let path = |name: &str| format!("bids[{index}].{name}");

    let object = bid.as_object().ok_or_else(|| {
        ValidationError::new(format!("bids[{index}]"), ValidationReason::WrongType("object"))
    })?;

    Ok(AdCandidate {
        advertiser_id: required(object, "advertiser_id", &path("advertiser_id"), coerce_id)?,
        // A bid without an amount is kept and later excluded as ineligible.
        bid_amount: optional(object, "bid_amount", &path("bid_amount"), coerce_number)?
            .unwrap_or_default(),
        category: optional(object, "category", &path("category"), coerce_label)?,
        relevance: optional(object, "relevance", &path("relevance"), coerce_number)?,
        expires_at: optional(object, "expires_at", &path("expires_at"), coerce_timestamp)?,
        remaining_budget: optional(
            object,
            "remaining_budget",
            &path("remaining_budget"),
            coerce_number,
        )?,
        blocked: optional(object, "blocked", &path("blocked"), coerce_bool)?.unwrap_or(false),
    })
}

/// A present, non-null field.
fn field<'v>(object: &'v Map<String, Value>, name: &str) -> Option<&'v Value> {
    object.get(name).filter(|value| !value.is_null())
}

fn required<T>(
    object: &Map<String, Value>,
    name: &str,
    path: &str,
    coerce: fn(&Value) -> Result<T, ValidationReason>,
) -> Result<T, ValidationError> {
    let value =
        field(object, name).ok_or_else(|| ValidationError::new(path, ValidationReason::Missing))?;

    coerce(value).map_err(|reason| ValidationError::new(path, reason))
}

fn optional<T>(
    object: &Map<String, Value>,
    name: &str,
    path: &str,
    coerce: fn(&Value) -> Result<T, ValidationReason>,
) -> Result<Option<T>, ValidationError> {
    field(object, name)
        .map(|value| coerce(value).map_err(|reason| ValidationError::new(path, reason)))
        .transpose()
}

fn required_id(
    object: &Map<String, Value>,
    name: &str,
    path: &str,
) -> Result<String, ValidationError> {
    required(object, name, path, coerce_id)
}

/// Identifiers may be non-empty strings or integers.
fn coerce_id(value: &Value) -> Result<String, ValidationReason> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_owned()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        _ => Err(ValidationReason::WrongType("non-empty string or integer id")),
    }
}

/// Category-like labels are matched case-insensitively, so they are lowercased here.
fn coerce_label(value: &Value) -> Result<String, ValidationReason> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_ascii_lowercase()),
        _ => Err(ValidationReason::WrongType("non-empty string")),
    }
}

/// Numbers may arrive as JSON numbers or numeric strings, and must be finite.
fn coerce_number(value: &Value) -> Result<f64, ValidationReason> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    number
        .filter(|n| n.is_finite())
        .ok_or(ValidationReason::WrongType("finite number"))
}

fn coerce_bool(value: &Value) -> Result<bool, ValidationReason> {
    value
        .as_bool()
        .ok_or(ValidationReason::WrongType("boolean"))
}

/// Timestamps may be RFC 3339 strings or integer seconds since the epoch.
fn coerce_timestamp(value: &Value) -> Result<DateTime<Utc>, ValidationReason> {
    let timestamp = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    };

    timestamp.ok_or(ValidationReason::WrongType("RFC 3339 timestamp or epoch seconds"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 20, 15, 30).unwrap()
    }

    fn decoder() -> Decoder {
        Decoder::new(chrono::Duration::seconds(300))
    }

    fn sample_body() -> Value {
        json!({
            "opportunity_id": "test-001",
            "timestamp": "2025-03-10T20:15:00Z",
            "user_id": "u_12345",
            "content_category": "sports",
            "device_type": "mobile",
            "region": "southeast",
            "bids": [
                {"advertiser_id": "adv_001", "bid_amount": 3.50, "category": "sportswear"},
                {"advertiser_id": "adv_002", "bid_amount": 4.20, "category": "fast_food"},
                {"advertiser_id": "adv_003", "bid_amount": 2.85, "category": "sportswear"}
            ]
        })
    }

    fn decode(body: Value) -> Result<AdRequestEvent, ValidationError> {
        decoder().decode(&RawMessage::new("msg-1", body.to_string()), now())
    }

    #[test]
    fn test_decodes_valid_message() {
        let event = decode(sample_body()).expect("failed to decode valid message");

        assert_eq!(event.event_id, "test-001");
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2025, 3, 10, 20, 15, 0).unwrap()
        );
        assert_eq!(event.context.content_category, "sports");
        assert_eq!(event.context.device_type, "mobile");
        assert_eq!(event.context.user_id.as_deref(), Some("u_12345"));
        assert_eq!(event.candidates.len(), 3);
        assert_eq!(event.candidates[1].advertiser_id, "adv_002");
        assert_eq!(event.candidates[1].bid_amount, 4.20);
        assert_eq!(event.candidates[1].category.as_deref(), Some("fast_food"));
        assert!(!event.candidates[1].blocked);
    }

    #[test]
    fn test_redelivery_yields_same_identity() {
        let first = decode(sample_body()).unwrap();
        let second = decode(sample_body()).unwrap();

        assert_eq!(first.event_id, second.event_id);
        assert_eq!(first, second);
    }

    #[test]
    fn test_coerces_loosely_typed_fields() {
        let mut body = sample_body();
        body["opportunity_id"] = json!(42);
        body["timestamp"] = json!(now().timestamp());
        body["content_category"] = json!("Sports");
        body["bids"] = json!([{"advertiser_id": 7, "bid_amount": "3.5", "blocked": true}]);

        let event = decode(body).expect("failed to decode coercible message");

        assert_eq!(event.event_id, "42");
        assert_eq!(event.timestamp, now());
        assert_eq!(event.context.content_category, "sports");
        assert_eq!(event.candidates[0].advertiser_id, "7");
        assert_eq!(event.candidates[0].bid_amount, 3.5);
        assert!(event.candidates[0].blocked);
    }

    #[test]
    fn test_request_id_is_accepted_as_identity() {
        let mut body = sample_body();
        body.as_object_mut().unwrap().remove("opportunity_id");
        body["request_id"] = json!("req-9");

        assert_eq!(decode(body).unwrap().event_id, "req-9");
    }

    #[test]
    fn test_missing_bid_amount_is_zero_and_device_defaults() {
        let mut body = sample_body();
        body.as_object_mut().unwrap().remove("device_type");
        body["bids"] = json!([{"advertiser_id": "adv_001"}]);

        let event = decode(body).unwrap();

        assert_eq!(event.context.device_type, "unknown");
        assert_eq!(event.candidates[0].bid_amount, 0.0);
    }

    #[test]
    fn test_empty_candidate_list_is_valid() {
        let mut body = sample_body();
        body["bids"] = json!([]);

        assert!(decode(body).unwrap().candidates.is_empty());
    }

    #[test]
    fn test_rejections_name_the_offending_field() {
        let cases: Vec<(Value, &str)> = vec![
            (json!("just a string"), "body"),
            (
                {
                    let mut b = sample_body();
                    b.as_object_mut().unwrap().remove("opportunity_id");
                    b
                },
                "opportunity_id",
            ),
            (
                {
                    let mut b = sample_body();
                    b["timestamp"] = json!("10/03/2025 20:15");
                    b
                },
                "timestamp",
            ),
            (
                {
                    let mut b = sample_body();
                    b["content_category"] = json!(12);
                    b
                },
                "content_category",
            ),
            (
                {
                    let mut b = sample_body();
                    b.as_object_mut().unwrap().remove("bids");
                    b
                },
                "bids",
            ),
            (
                {
                    let mut b = sample_body();
                    b["bids"] = json!({"advertiser_id": "adv_001"});
                    b
                },
                "bids",
            ),
            (
                {
                    let mut b = sample_body();
                    b["bids"][1]["bid_amount"] = json!("lots");
                    b
                },
                "bids[1].bid_amount",
            ),
            (
                {
                    let mut b = sample_body();
                    b["bids"][2] = json!({"bid_amount": 1.0});
                    b
                },
                "bids[2].advertiser_id",
            ),
            (
                {
                    let mut b = sample_body();
                    b["bids"][0] = json!("adv_001");
                    b
                },
                "bids[0]",
            ),
        ];

        for (body, expected_field) in cases {
            let error = decode(body).expect_err("message should have been rejected");
            assert_eq!(error.field, expected_field);
        }
    }

    #[test]
    fn test_unparseable_body() {
        let error = decoder()
            .decode(&RawMessage::new("msg-1", "{not json"), now())
            .expect_err("message should have been rejected");

        assert_eq!(error.field, "body");
        assert!(matches!(error.reason, ValidationReason::MalformedJson(_)));
    }

    #[test]
    fn test_timestamp_outside_skew_window() {
        let mut body = sample_body();
        body["timestamp"] = json!("2025-03-10T19:00:00Z");

        let error = decode(body).expect_err("stale message should have been rejected");

        assert_eq!(error.field, "timestamp");
        assert_eq!(
            error.reason,
            ValidationReason::OutsideSkewWindow {
                skew_seconds: 4530,
                max_skew_seconds: 300
            }
        );

        // Future timestamps are held to the same window.
        let mut body = sample_body();
        body["timestamp"] = json!("2025-03-10T21:00:00Z");
        assert!(decode(body).is_err());
    }

    #[test]
    fn test_skew_is_measured_from_receipt() {
        let message = RawMessage::new("msg-1", sample_body().to_string()).with_received_at(now());
        // A redelivery ten minutes after receipt still sees the original verdict.
        let later = now() + chrono::Duration::minutes(10);

        let event = decoder()
            .decode(&message, later)
            .expect("received message should still be within the window");
        assert_eq!(event.event_id, "test-001");

        let late = RawMessage::new("msg-2", sample_body().to_string())
            .with_received_at(now() + chrono::Duration::hours(1));
        let error = decoder()
            .decode(&late, now())
            .expect_err("message received an hour after its timestamp should be rejected");
        assert_eq!(error.field, "timestamp");
    }
}
