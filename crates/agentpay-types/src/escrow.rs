//! Escrow types for AgentPay
//!
//! An escrow is a persistent record of an intent to transfer value from a
//! payer to a payee, released only when its declared conditions are
//! satisfied. Escrows are never destroyed; terminal records remain as the
//! audit trail.

use crate::{EscrowId, Token};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    /// Created, waiting for on-chain funding
    Pending,
    /// Funded, waiting for approvals
    Funded,
    /// Funds committed; delivery and release may proceed
    Locked,
    /// Funds released to payee
    Released,
    /// Funds returned to payer
    Refunded,
    /// In dispute, awaiting arbiter decision
    Disputed,
}

impl EscrowState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// States eligible for the timeout sweeper
    pub fn is_refundable(&self) -> bool {
        matches!(self, Self::Funded | Self::Locked | Self::Disputed)
    }

    /// Wire/persistence string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::Locked => "locked",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
        }
    }
}

impl fmt::Display for EscrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions declared at creation that gate the release path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowConditions {
    /// Both parties must approve before funds lock
    pub requires_approval: bool,
    /// A delivery proof must be recorded before release
    pub requires_delivery: bool,
    /// Release requires an arbiter decision
    pub requires_arbiter: bool,
    /// Release requires explicit client confirmation
    pub requires_client_confirmation: bool,
}

impl EscrowConditions {
    /// Delivery submission releases the escrow in the same call when nobody
    /// else has to sign off. Approval-gated escrows keep release manual:
    /// parties that opted into sign-off also sign off on release.
    pub fn auto_release_on_delivery(&self) -> bool {
        self.requires_delivery
            && !self.requires_approval
            && !self.requires_arbiter
            && !self.requires_client_confirmation
    }
}

/// Proof of delivery recorded against a locked escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryProof {
    /// Who submitted the proof
    pub submitted_by: String,
    /// When it was submitted
    pub submitted_at: DateTime<Utc>,
    /// Opaque proof payload
    pub data: serde_json::Value,
    /// Optional detached signature over the payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Dispute raised against a locked escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub disputed_by: String,
    pub reason: String,
    pub disputed_at: DateTime<Utc>,
}

/// Arbiter decision when resolving a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeDecision {
    /// Release funds to the payee
    Release,
    /// Return funds to the payer
    Refund,
}

/// Instants of each transition, in order of occurrence
///
/// Exactly one of `released_at`/`refunded_at` is set once the escrow is
/// terminal, and every set instant is >= the ones recorded before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowTimeline {
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disputed_at: Option<DateTime<Utc>>,
}

impl EscrowTimeline {
    /// Start a timeline at the creation instant
    pub fn starting(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            funded_at: None,
            locked_at: None,
            released_at: None,
            refunded_at: None,
            disputed_at: None,
        }
    }

    /// All recorded instants, in recording order
    pub fn instants(&self) -> Vec<DateTime<Utc>> {
        [
            Some(self.created_at),
            self.funded_at,
            self.locked_at,
            self.disputed_at,
            self.released_at,
            self.refunded_at,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// An escrow record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    /// Unique escrow ID
    pub id: EscrowId,
    /// Party that funds the escrow
    pub payer: String,
    /// Party that receives on release
    pub payee: String,
    /// Amount in the token's display unit
    pub amount: Decimal,
    /// Settlement token
    pub token: Token,
    /// Adapter tag derived from the token
    pub adapter: String,
    /// What the escrow is for
    pub purpose: String,
    /// Release conditions
    pub conditions: EscrowConditions,
    /// Absolute instant after which the timeout sweeper refunds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    /// Party identifiers that have approved, in approval order
    pub approvals: Vec<String>,
    /// Delivery proof, once submitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_proof: Option<DeliveryProof>,
    /// Dispute record, once raised
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute: Option<DisputeRecord>,
    /// External transaction hash reported at funding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_hash: Option<String>,
    /// Reason recorded at release/refund
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
    /// Arbiter that resolved a dispute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Current state
    pub state: EscrowState,
    /// Transition instants
    pub timeline: EscrowTimeline,
}

impl Escrow {
    /// Check whether the timeout has elapsed at `now`
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Both counterparties have approved
    pub fn fully_approved(&self) -> bool {
        self.approvals.iter().any(|a| *a == self.payer)
            && self.approvals.iter().any(|a| *a == self.payee)
    }
}

/// Parameters for creating an escrow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrow {
    pub payer: String,
    pub payee: String,
    pub amount: Decimal,
    pub purpose: String,
    pub token: Token,
    #[serde(default)]
    pub conditions: EscrowConditions,
    /// Minutes until the timeout sweeper refunds; no timeout when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(state: EscrowState) -> Escrow {
        Escrow {
            id: EscrowId::new(),
            payer: "payer".into(),
            payee: "payee".into(),
            amount: dec!(100),
            token: Token::Native,
            adapter: Token::Native.adapter_tag().into(),
            purpose: "test".into(),
            conditions: EscrowConditions::default(),
            timeout_at: None,
            approvals: Vec::new(),
            delivery_proof: None,
            dispute: None,
            settlement_hash: None,
            closed_reason: None,
            resolved_by: None,
            state,
            timeline: EscrowTimeline::starting(Utc::now()),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(EscrowState::Released.is_terminal());
        assert!(EscrowState::Refunded.is_terminal());
        assert!(!EscrowState::Disputed.is_terminal());
        assert!(!EscrowState::Pending.is_terminal());
    }

    #[test]
    fn test_full_approval() {
        let mut escrow = sample(EscrowState::Funded);
        assert!(!escrow.fully_approved());
        escrow.approvals.push("payer".into());
        assert!(!escrow.fully_approved());
        escrow.approvals.push("payee".into());
        assert!(escrow.fully_approved());
    }

    #[test]
    fn test_auto_release_conditions() {
        let conditions = EscrowConditions {
            requires_delivery: true,
            ..Default::default()
        };
        assert!(conditions.auto_release_on_delivery());

        let gated = EscrowConditions {
            requires_delivery: true,
            requires_client_confirmation: true,
            ..Default::default()
        };
        assert!(!gated.auto_release_on_delivery());

        let approval_gated = EscrowConditions {
            requires_approval: true,
            requires_delivery: true,
            ..Default::default()
        };
        assert!(!approval_gated.auto_release_on_delivery());
    }

    #[test]
    fn test_timeout() {
        let mut escrow = sample(EscrowState::Funded);
        let now = Utc::now();
        assert!(!escrow.timed_out(now));
        escrow.timeout_at = Some(now);
        assert!(escrow.timed_out(now));
    }
}
