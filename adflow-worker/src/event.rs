use chrono::{DateTime, Utc};

/// A message as delivered by the queue: an opaque id plus the serialized body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Queue-assigned identity. Used to acknowledge or redeliver the message,
    /// including messages whose body is too malformed to yield an event identity.
    pub message_id: String,
    pub body: String,
    /// When the queue first accepted the message. Stable across redeliveries, so the
    /// timestamp skew check gives the same verdict on every attempt.
    pub received_at: Option<DateTime<Utc>>,
}

impl RawMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            received_at: None,
        }
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }
}

/// Attributes of the placement an ad is being selected for.
#[derive(Debug, Clone, PartialEq)]
pub struct AdContext {
    pub user_id: Option<String>,
    pub content_category: String,
    pub device_type: String,
    pub region: Option<String>,
}

/// One bid competing for an ad request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdCandidate {
    pub advertiser_id: String,
    /// Zero when the bid carried no amount.
    pub bid_amount: f64,
    /// Advertiser category, matched against the content category for relevance.
    pub category: Option<String>,
    /// Explicit relevance signal, if the bidder supplied one.
    pub relevance: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_budget: Option<f64>,
    pub blocked: bool,
}

/// A validated ad request.
///
/// `event_id` comes straight from the message body, so every redelivery of the same
/// message yields the same identity and the same result key.
#[derive(Debug, Clone, PartialEq)]
pub struct AdRequestEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub context: AdContext,
    pub candidates: Vec<AdCandidate>,
}
