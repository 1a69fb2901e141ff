//! Webhook subscription, event, and delivery types
//!
//! Event types form a closed set; string forms exist only at the
//! persistence and wire boundary. The reserved `test` type is deliverable
//! only through the synchronous test path, never through `emit`.

use crate::{AgentPayError, EventId, Result, SubscriptionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of event types the broker emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EscrowCreated,
    EscrowFunded,
    EscrowLocked,
    EscrowReleased,
    EscrowRefunded,
    EscrowDisputed,
    TippingReceived,
    PaymentSettled,
    /// Reserved for synchronous subscription tests; rejected by `emit`
    Test,
}

impl EventType {
    /// The recognized set subscriptions may filter on
    pub const RECOGNIZED: [EventType; 8] = [
        EventType::EscrowCreated,
        EventType::EscrowFunded,
        EventType::EscrowLocked,
        EventType::EscrowReleased,
        EventType::EscrowRefunded,
        EventType::EscrowDisputed,
        EventType::TippingReceived,
        EventType::PaymentSettled,
    ];

    /// Wire/persistence string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscrowCreated => "escrow_created",
            Self::EscrowFunded => "escrow_funded",
            Self::EscrowLocked => "escrow_locked",
            Self::EscrowReleased => "escrow_released",
            Self::EscrowRefunded => "escrow_refunded",
            Self::EscrowDisputed => "escrow_disputed",
            Self::TippingReceived => "tipping_received",
            Self::PaymentSettled => "payment_settled",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = AgentPayError;

    /// Parse a wire tag; only the recognized set is accepted, the reserved
    /// `test` tag included in the rejections
    fn from_str(s: &str) -> Result<Self> {
        EventType::RECOGNIZED
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AgentPayError::InvalidEventType {
                event_type: s.to_string(),
            })
    }
}

/// An immutable record of a state transition
///
/// The id is generated at emit, not at delivery, so retries of the same
/// event carry the same `X-Event-ID`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Fresh id assigned at emit
    pub id: EventId,
    /// Event tag
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Emit instant, epoch milliseconds
    pub timestamp: i64,
    /// Transition payload
    pub data: serde_json::Value,
    /// Caller-supplied context
    pub context: serde_json::Value,
}

impl WebhookEvent {
    /// Create an event stamped at `now`
    pub fn new(event_type: EventType, data: serde_json::Value, context: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            timestamp: Utc::now().timestamp_millis(),
            data,
            context,
        }
    }
}

/// A registered webhook endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique subscription ID
    pub id: SubscriptionId,
    /// Target URL (http or https)
    pub url: String,
    /// Event types this endpoint receives
    pub events: Vec<EventType>,
    /// Hex-encoded 32-byte signing secret; returned exactly once at
    /// registration and never re-emitted
    pub secret: String,
    /// Disabled subscriptions match no events
    pub enabled: bool,
    /// Custom headers sent with every delivery
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Successful deliveries
    pub successes: u64,
    /// Failed delivery attempts (transient and permanent)
    pub failures: u64,
    /// Attempts that were rescheduled
    pub retries: u64,
    /// Last successful delivery instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Registration instant
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether this subscription should receive `event_type`
    pub fn matches(&self, event_type: EventType) -> bool {
        self.enabled && self.events.contains(&event_type)
    }
}

/// Redacted view of a subscription, safe for list responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub url: String,
    pub events: Vec<EventType>,
    pub enabled: bool,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Subscription> for SubscriptionInfo {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id.clone(),
            url: sub.url.clone(),
            events: sub.events.clone(),
            enabled: sub.enabled,
            successes: sub.successes,
            failures: sub.failures,
            retries: sub.retries,
            last_triggered_at: sub.last_triggered_at,
            created_at: sub.created_at,
        }
    }
}

/// Status tag of a queued delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// First attempt not yet made
    Pending,
    /// Rescheduled after a transient failure
    Retrying,
}

/// One scheduled attempt to transmit one event to one subscription
///
/// `payload` is the canonical JSON serialized at enqueue; the same bytes
/// are signed and transmitted on every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub subscription_id: SubscriptionId,
    pub event: WebhookEvent,
    pub payload: String,
    /// Attempt counter, >= 1
    pub attempt: u32,
    /// Eligible-to-send instant; absent means send now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
}

impl Delivery {
    /// Whether this delivery is due at `now`
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
    }
}
