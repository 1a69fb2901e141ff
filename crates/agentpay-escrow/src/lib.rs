//! AgentPay Escrow - the escrow state machine engine
//!
//! Owns the escrow collection and enforces every transition:
//!
//! ```text
//! pending --fund--> funded --approve(all)--> locked --release--> released
//!                     |    (auto when no approval     |--refund--> refunded
//!                     |     is required)              |--dispute-> disputed
//!                     +------- refund ----------------+              |
//!                                           resolveDispute: released|refunded
//! ```
//!
//! The collection is rewritten to its snapshot file after every successful
//! mutation, inside the write lock. Events are published after the snapshot
//! commits and outside the lock; an event missed between commit and a crash
//! is acceptable loss - the re-issued operation fails its precondition on
//! the already-advanced record.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use agentpay_types::{
    CreateEscrow, DeliveryProof, DisputeDecision, DisputeRecord, Escrow, EscrowConditions,
    EscrowId, EscrowState, EscrowTimeline,
};

use agentpay_store::JsonSnapshot;
use agentpay_types::{AgentPayError, EventPublisher, EventType, NullPublisher, Result};

/// Snapshot file name under the engine's data directory
const SNAPSHOT_FILE: &str = "escrows.json";

type PendingEvent = (EventType, serde_json::Value);

/// The escrow engine
///
/// All writes go through the collection's write lock; reads clone from a
/// consistent snapshot.
pub struct EscrowEngine {
    escrows: Arc<RwLock<HashMap<EscrowId, Escrow>>>,
    snapshot: JsonSnapshot,
    publisher: Arc<dyn EventPublisher>,
}

impl EscrowEngine {
    /// Open the engine, rehydrating any persisted collection from `dir`
    pub fn load(dir: impl AsRef<Path>, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let snapshot = JsonSnapshot::in_dir(dir, SNAPSHOT_FILE);
        let escrows: HashMap<EscrowId, Escrow> = snapshot.load()?.unwrap_or_default();
        if !escrows.is_empty() {
            info!(count = escrows.len(), "escrow collection rehydrated");
        }
        Ok(Self {
            escrows: Arc::new(RwLock::new(escrows)),
            snapshot,
            publisher,
        })
    }

    /// Open the engine without a webhook wiring; events are dropped
    pub fn load_detached(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load(dir, Arc::new(NullPublisher))
    }

    /// Create a new escrow in `pending`
    pub async fn create(&self, params: CreateEscrow) -> Result<Escrow> {
        if params.payer.trim().is_empty() {
            return Err(AgentPayError::invalid_input("payer", "must not be empty"));
        }
        if params.payee.trim().is_empty() {
            return Err(AgentPayError::invalid_input("payee", "must not be empty"));
        }
        if params.amount.is_sign_negative() || params.amount.is_zero() {
            return Err(AgentPayError::invalid_input("amount", "must be positive"));
        }

        let now = Utc::now();
        let mut conditions = params.conditions;
        conditions.requires_approval = conditions.requires_approval || params.token.requires_approval();

        let escrow = Escrow {
            id: EscrowId::new(),
            payer: params.payer,
            payee: params.payee,
            amount: params.amount,
            token: params.token,
            adapter: params.token.adapter_tag().to_string(),
            purpose: params.purpose,
            conditions,
            timeout_at: params.timeout_minutes.map(|m| now + Duration::minutes(m)),
            approvals: Vec::new(),
            delivery_proof: None,
            dispute: None,
            settlement_hash: None,
            closed_reason: None,
            resolved_by: None,
            state: EscrowState::Pending,
            timeline: EscrowTimeline::starting(now),
        };

        {
            let mut escrows = self.escrows.write().await;
            escrows.insert(escrow.id.clone(), escrow.clone());
            self.snapshot.save(&*escrows)?;
        }

        info!(escrow_id = %escrow.id, amount = %escrow.amount, token = %escrow.token, "escrow created");
        self.publish(vec![(EventType::EscrowCreated, Self::event_data(&escrow))])
            .await;
        Ok(escrow)
    }

    /// Record on-chain funding; locks in the same call when no approval is
    /// required
    pub async fn fund(&self, id: &EscrowId, external_hash: &str) -> Result<Escrow> {
        let (escrow, events) = self
            .mutate(id, |escrow| {
                Self::expect_state(escrow, EscrowState::Pending, "escrow is not pending funding")?;
                let now = Utc::now();
                escrow.state = EscrowState::Funded;
                escrow.settlement_hash = Some(external_hash.to_string());
                escrow.timeline.funded_at = Some(now);

                let mut events = vec![(EventType::EscrowFunded, Self::event_data(escrow))];
                if !escrow.conditions.requires_approval {
                    escrow.state = EscrowState::Locked;
                    escrow.timeline.locked_at = Some(now);
                    events.push((EventType::EscrowLocked, Self::event_data(escrow)));
                }
                Ok(events)
            })
            .await?;

        info!(escrow_id = %escrow.id, state = %escrow.state, "escrow funded");
        self.publish(events).await;
        Ok(escrow)
    }

    /// Record an approval; locks once both counterparties have approved
    pub async fn approve(&self, id: &EscrowId, approver: &str) -> Result<Escrow> {
        let (escrow, events) = self
            .mutate(id, |escrow| {
                Self::expect_state(escrow, EscrowState::Funded, "escrow is not awaiting approvals")?;
                if escrow.approvals.iter().any(|a| a == approver) {
                    return Err(AgentPayError::precondition(
                        escrow.state.as_str(),
                        format!("approver {approver} already recorded"),
                    ));
                }
                escrow.approvals.push(approver.to_string());

                let mut events = Vec::new();
                if escrow.fully_approved() {
                    escrow.state = EscrowState::Locked;
                    escrow.timeline.locked_at = Some(Utc::now());
                    events.push((EventType::EscrowLocked, Self::event_data(escrow)));
                }
                Ok(events)
            })
            .await?;

        info!(escrow_id = %escrow.id, approver, state = %escrow.state, "approval recorded");
        self.publish(events).await;
        Ok(escrow)
    }

    /// Record a delivery proof against a locked escrow; releases in the same
    /// call when nobody else has to sign off
    ///
    /// The proof is written before the release branch runs, and both land in
    /// one snapshot, so a release can never be observed without its proof.
    pub async fn submit_delivery(
        &self,
        id: &EscrowId,
        submitted_by: &str,
        data: serde_json::Value,
        signature: Option<String>,
    ) -> Result<Escrow> {
        let (escrow, events) = self
            .mutate(id, |escrow| {
                Self::expect_state(escrow, EscrowState::Locked, "escrow is not locked")?;
                escrow.delivery_proof = Some(DeliveryProof {
                    submitted_by: submitted_by.to_string(),
                    submitted_at: Utc::now(),
                    data,
                    signature,
                });

                if escrow.conditions.auto_release_on_delivery() {
                    Self::close(escrow, EscrowState::Released, "automatic - delivery confirmed", None)?;
                    return Ok(vec![(EventType::EscrowReleased, Self::event_data(escrow))]);
                }
                Ok(Vec::new())
            })
            .await?;

        info!(escrow_id = %escrow.id, state = %escrow.state, "delivery proof recorded");
        self.publish(events).await;
        Ok(escrow)
    }

    /// Release a locked escrow to the payee
    pub async fn release(&self, id: &EscrowId, reason: &str) -> Result<Escrow> {
        let (escrow, events) = self
            .mutate(id, |escrow| {
                Self::expect_state(escrow, EscrowState::Locked, "escrow is not locked")?;
                Self::close(escrow, EscrowState::Released, reason, None)?;
                Ok(vec![(EventType::EscrowReleased, Self::event_data(escrow))])
            })
            .await?;

        info!(escrow_id = %escrow.id, reason, "escrow released");
        self.publish(events).await;
        Ok(escrow)
    }

    /// Refund a funded, locked, or disputed escrow to the payer
    pub async fn refund(&self, id: &EscrowId, reason: &str) -> Result<Escrow> {
        let (escrow, events) = self
            .mutate(id, |escrow| {
                if !escrow.state.is_refundable() {
                    return Err(AgentPayError::precondition(
                        escrow.state.as_str(),
                        "only funded, locked, or disputed escrows can be refunded",
                    ));
                }
                Self::close(escrow, EscrowState::Refunded, reason, None)?;
                Ok(vec![(EventType::EscrowRefunded, Self::event_data(escrow))])
            })
            .await?;

        info!(escrow_id = %escrow.id, reason, "escrow refunded");
        self.publish(events).await;
        Ok(escrow)
    }

    /// Raise a dispute against a locked escrow
    pub async fn dispute(&self, id: &EscrowId, disputed_by: &str, reason: &str) -> Result<Escrow> {
        let (escrow, events) = self
            .mutate(id, |escrow| {
                Self::expect_state(escrow, EscrowState::Locked, "only locked escrows can be disputed")?;
                escrow.state = EscrowState::Disputed;
                escrow.dispute = Some(DisputeRecord {
                    disputed_by: disputed_by.to_string(),
                    reason: reason.to_string(),
                    disputed_at: Utc::now(),
                });
                escrow.timeline.disputed_at = Some(Utc::now());
                Ok(vec![(EventType::EscrowDisputed, Self::event_data(escrow))])
            })
            .await?;

        warn!(escrow_id = %escrow.id, disputed_by, reason, "escrow disputed");
        self.publish(events).await;
        Ok(escrow)
    }

    /// Resolve a dispute by arbiter decision
    ///
    /// The arbiter decision overrides the delivery-proof requirement; the
    /// outcome is recorded with reason `arbiter decision by <arbiter>`.
    pub async fn resolve_dispute(
        &self,
        id: &EscrowId,
        decision: DisputeDecision,
        arbiter: &str,
    ) -> Result<Escrow> {
        let reason = format!("arbiter decision by {arbiter}");
        let (escrow, events) = self
            .mutate(id, |escrow| {
                Self::expect_state(escrow, EscrowState::Disputed, "escrow is not in dispute")?;
                let (state, event_type) = match decision {
                    DisputeDecision::Release => (EscrowState::Released, EventType::EscrowReleased),
                    DisputeDecision::Refund => (EscrowState::Refunded, EventType::EscrowRefunded),
                };
                Self::close(escrow, state, &reason, Some(arbiter))?;
                Ok(vec![(event_type, Self::event_data(escrow))])
            })
            .await?;

        info!(escrow_id = %escrow.id, arbiter, decision = ?decision, "dispute resolved");
        self.publish(events).await;
        Ok(escrow)
    }

    /// Refund every funded or locked escrow whose timeout has elapsed
    ///
    /// Idempotent: a second sweep with no time advance refunds nothing,
    /// because the first sweep moved the eligible records to `refunded`.
    pub async fn process_timeouts(&self) -> Result<Vec<EscrowId>> {
        let now = Utc::now();
        let mut refunded = Vec::new();
        let mut events = Vec::new();

        {
            let mut escrows = self.escrows.write().await;
            for escrow in escrows.values_mut() {
                let eligible = matches!(escrow.state, EscrowState::Funded | EscrowState::Locked);
                if eligible && escrow.timed_out(now) {
                    Self::close(escrow, EscrowState::Refunded, "automatic timeout", None)?;
                    events.push((EventType::EscrowRefunded, Self::event_data(escrow)));
                    refunded.push(escrow.id.clone());
                }
            }
            if !refunded.is_empty() {
                self.snapshot.save(&*escrows)?;
            }
        }

        if !refunded.is_empty() {
            info!(count = refunded.len(), "timed-out escrows refunded");
            self.publish(events).await;
        }
        Ok(refunded)
    }

    /// Get an escrow by id
    pub async fn get(&self, id: &EscrowId) -> Result<Escrow> {
        self.escrows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentPayError::EscrowNotFound {
                escrow_id: id.to_string(),
            })
    }

    /// All escrows
    pub async fn list(&self) -> Vec<Escrow> {
        self.escrows.read().await.values().cloned().collect()
    }

    /// Escrows in a given state
    pub async fn list_by_state(&self, state: EscrowState) -> Vec<Escrow> {
        self.escrows
            .read()
            .await
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect()
    }

    /// Escrows funded by a payer
    pub async fn list_by_payer(&self, payer: &str) -> Vec<Escrow> {
        self.escrows
            .read()
            .await
            .values()
            .filter(|e| e.payer == payer)
            .cloned()
            .collect()
    }

    /// Escrows paying out to a payee
    pub async fn list_by_payee(&self, payee: &str) -> Vec<Escrow> {
        self.escrows
            .read()
            .await
            .values()
            .filter(|e| e.payee == payee)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Apply `op` to the escrow under the write lock, snapshot on success,
    /// and hand back the pending events for publication after unlock
    async fn mutate<F>(&self, id: &EscrowId, op: F) -> Result<(Escrow, Vec<PendingEvent>)>
    where
        F: FnOnce(&mut Escrow) -> Result<Vec<PendingEvent>>,
    {
        let mut escrows = self.escrows.write().await;
        let escrow = escrows.get_mut(id).ok_or_else(|| AgentPayError::EscrowNotFound {
            escrow_id: id.to_string(),
        })?;
        let events = op(escrow)?;
        let escrow = escrow.clone();
        self.snapshot.save(&*escrows)?;
        Ok((escrow, events))
    }

    fn expect_state(escrow: &Escrow, expected: EscrowState, reason: &str) -> Result<()> {
        if escrow.state != expected {
            return Err(AgentPayError::precondition(escrow.state.as_str(), reason));
        }
        Ok(())
    }

    /// Terminal transition shared by release, refund, dispute resolution,
    /// and the timeout sweeper
    fn close(
        escrow: &mut Escrow,
        state: EscrowState,
        reason: &str,
        resolved_by: Option<&str>,
    ) -> Result<()> {
        if state == EscrowState::Released
            && escrow.conditions.requires_delivery
            && escrow.delivery_proof.is_none()
            && escrow.dispute.is_none()
        {
            return Err(AgentPayError::precondition(
                escrow.state.as_str(),
                "delivery required",
            ));
        }

        let now = Utc::now();
        escrow.state = state;
        escrow.closed_reason = Some(reason.to_string());
        if let Some(arbiter) = resolved_by {
            escrow.resolved_by = Some(arbiter.to_string());
        }
        match state {
            EscrowState::Released => escrow.timeline.released_at = Some(now),
            EscrowState::Refunded => escrow.timeline.refunded_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    fn event_data(escrow: &Escrow) -> serde_json::Value {
        serde_json::json!({
            "escrowId": escrow.id.to_string(),
            "payer": escrow.payer,
            "payee": escrow.payee,
            "amount": escrow.amount,
            "token": escrow.token,
            "state": escrow.state,
        })
    }

    /// Publish pending events; emit failures are logged, never propagated -
    /// the transition has already committed
    async fn publish(&self, events: Vec<PendingEvent>) {
        for (event_type, data) in events {
            let context = serde_json::json!({ "source": "escrow" });
            if let Err(err) = self.publisher.emit(event_type, data, context).await {
                warn!(event_type = %event_type, error = %err, "event emit failed");
            }
        }
    }
}
