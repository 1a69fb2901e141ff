//! Negotiation quote types
//!
//! A quote is a priced offer for a described service from a provider to a
//! client, negotiable through counter-offers until accepted, rejected, or
//! expired.

use crate::{EscrowId, QuoteId, Token};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteState {
    Pending,
    Accepted,
    Rejected,
    Countered,
    Expired,
}

impl QuoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Countered => "countered",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for QuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiated terms of service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteTerms {
    /// Expected delivery time; also sizes the escrow timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_time_minutes: Option<i64>,
    /// Free-form quality guarantee text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_guarantee: Option<String>,
    /// Refund policy label
    pub refund_policy: String,
    /// Whether acceptance constructs an escrow
    pub escrow_required: bool,
    /// Delivery submission releases without client confirmation
    pub auto_release: bool,
    /// Release requires an arbiter decision
    pub requires_arbiter: bool,
}

impl Default for QuoteTerms {
    fn default() -> Self {
        Self {
            delivery_time_minutes: None,
            quality_guarantee: None,
            refund_policy: "none".to_string(),
            escrow_required: true,
            auto_release: false,
            requires_arbiter: false,
        }
    }
}

impl QuoteTerms {
    /// Merge a counter-offer overlay into these terms
    pub fn apply(&mut self, overlay: &TermsOverlay) {
        if let Some(minutes) = overlay.delivery_time_minutes {
            self.delivery_time_minutes = Some(minutes);
        }
        if let Some(guarantee) = &overlay.quality_guarantee {
            self.quality_guarantee = Some(guarantee.clone());
        }
        if let Some(policy) = &overlay.refund_policy {
            self.refund_policy = policy.clone();
        }
        if let Some(required) = overlay.escrow_required {
            self.escrow_required = required;
        }
        if let Some(auto) = overlay.auto_release {
            self.auto_release = auto;
        }
        if let Some(arbiter) = overlay.requires_arbiter {
            self.requires_arbiter = arbiter;
        }
    }
}

/// Partial terms carried by a counter-offer; only present fields override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TermsOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_time_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_guarantee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_release: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_arbiter: Option<bool>,
}

/// One counter-offer in a negotiation; the list is append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterOffer {
    pub offered_by: String,
    pub price: Decimal,
    pub terms: TermsOverlay,
    pub offered_at: DateTime<Utc>,
}

/// Delivery metadata recorded by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteDelivery {
    pub delivered_at: DateTime<Utc>,
    pub proof: serde_json::Value,
}

/// A negotiation quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Unique quote ID
    pub id: QuoteId,
    /// Party offering the service
    pub provider: String,
    /// Party the offer is addressed to
    pub client: String,
    /// Description of the service
    pub service: String,
    /// Base asking price
    pub price: Decimal,
    /// Settlement token
    pub token: Token,
    /// Current terms (base terms with any accepted overlay applied)
    pub terms: QuoteTerms,
    /// Instant the quote stops being acceptable; acceptance at exactly this
    /// instant still succeeds
    pub expires_at: DateTime<Utc>,
    /// Counter-offers, append-only
    pub counters: Vec<CounterOffer>,
    /// Final price, set exactly once at acceptance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreed_price: Option<Decimal>,
    /// Escrow constructed at acceptance when terms require one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<EscrowId>,
    /// Reason recorded at rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Delivery metadata, once the provider marks delivered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<QuoteDelivery>,
    /// Current state
    pub state: QuoteState,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Parameters for opening a quote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQuote {
    pub provider: String,
    pub client: String,
    pub service: String,
    pub price: Decimal,
    pub token: Token,
    #[serde(default)]
    pub terms: QuoteTerms,
    pub valid_for_minutes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms_defaults() {
        let terms = QuoteTerms::default();
        assert!(terms.escrow_required);
        assert_eq!(terms.refund_policy, "none");
        assert!(!terms.auto_release);
    }

    #[test]
    fn test_overlay_merge() {
        let mut terms = QuoteTerms::default();
        terms.apply(&TermsOverlay {
            delivery_time_minutes: Some(15),
            auto_release: Some(true),
            ..Default::default()
        });
        assert_eq!(terms.delivery_time_minutes, Some(15));
        assert!(terms.auto_release);
        // untouched fields keep their values
        assert!(terms.escrow_required);
    }
}
