//! In-process lifecycle signals
//!
//! Broadcast to observers (tests, monitors) after each delivery outcome and
//! each queue pass. Signals carry identifiers only - never payloads or
//! secrets.

use agentpay_types::{EventId, SubscriptionId};

/// Signals broadcast by the delivery engine
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookSignal {
    /// A delivery got a 2xx response
    Delivered {
        subscription_id: SubscriptionId,
        event_id: EventId,
    },
    /// A delivery exhausted its attempts and was dropped
    DeliveryFailed {
        subscription_id: SubscriptionId,
        event_id: EventId,
    },
    /// A queue pass finished (including empty passes)
    QueueProcessed,
    /// The engine is shutting down; no further signals follow
    ShuttingDown,
}
