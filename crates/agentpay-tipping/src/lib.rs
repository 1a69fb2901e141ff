//! AgentPay Tipping - repository-attributed tips carried by escrow
//!
//! A thin orchestrator above the escrow engine, specialized by the
//! repository-reference data type. The tip record tracks the escrow's
//! progress as the caller drives it (create, fund, lock, release) and the
//! engine emits `tipping_received` and `payment_settled` through the
//! webhook seam.

pub mod stats;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use agentpay_types::{
    CreateTip, RepoRef, Tip, TipId, TipRecipient, TipSettlement, TipState, TipTimeline,
};
pub use stats::{GlobalStats, RepoStats, RepoTotal, TipperStats, TokenBucket};

use agentpay_escrow::EscrowEngine;
use agentpay_store::JsonSnapshot;
use agentpay_types::{
    AgentPayError, CreateEscrow, EscrowConditions, EscrowId, EventPublisher, EventType,
    NullPublisher, PaymentExecutor, PaymentKind, PaymentRequest, Result, Token,
};

/// Snapshot file name under the engine's data directory
const SNAPSHOT_FILE: &str = "tips.json";

/// Constructs the escrow that carries a tip's settlement
#[async_trait]
pub trait EscrowFactory: Send + Sync {
    async fn create_escrow(&self, tip: &Tip) -> Result<EscrowId>;
}

/// The production factory: an escrow from the tipper to the recipient for
/// the tip amount, with no conditions beyond the token's approval policy
pub struct TipEscrowFactory {
    engine: Arc<EscrowEngine>,
}

impl TipEscrowFactory {
    pub fn new(engine: Arc<EscrowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EscrowFactory for TipEscrowFactory {
    async fn create_escrow(&self, tip: &Tip) -> Result<EscrowId> {
        let escrow = self
            .engine
            .create(CreateEscrow {
                payer: tip.tipper.clone(),
                payee: tip.recipient.to_string(),
                amount: tip.amount,
                purpose: format!("tip to {}", tip.repo),
                token: tip.token,
                conditions: EscrowConditions::default(),
                timeout_minutes: None,
            })
            .await?;
        Ok(escrow.id)
    }
}

/// Filters for the nightly settlement batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipper: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
}

/// Tips awaiting settlement and their sum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipBatch {
    pub tips: Vec<Tip>,
    pub count: usize,
    pub total: Decimal,
}

/// The tipping engine
pub struct TippingEngine {
    tips: Arc<RwLock<HashMap<TipId, Tip>>>,
    snapshot: JsonSnapshot,
    publisher: Arc<dyn EventPublisher>,
    executor: Option<Arc<dyn PaymentExecutor>>,
}

impl TippingEngine {
    /// Open the engine, rehydrating any persisted collection from `dir`
    pub fn load(dir: impl AsRef<Path>, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let snapshot = JsonSnapshot::in_dir(dir, SNAPSHOT_FILE);
        let tips: HashMap<TipId, Tip> = snapshot.load()?.unwrap_or_default();
        if !tips.is_empty() {
            info!(count = tips.len(), "tip collection rehydrated");
        }
        Ok(Self {
            tips: Arc::new(RwLock::new(tips)),
            snapshot,
            publisher,
            executor: None,
        })
    }

    /// Open the engine without a webhook wiring; events are dropped
    pub fn load_detached(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load(dir, Arc::new(NullPublisher))
    }

    /// Attach an on-chain payment executor for `settle_tip`
    pub fn with_executor(mut self, executor: Arc<dyn PaymentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Record a new tip in `pending`
    pub async fn create_tip(&self, params: CreateTip) -> Result<Tip> {
        let repo = RepoRef::parse(&params.repo)?;
        let recipient = TipRecipient::parse(&params.recipient)?;
        if params.tipper.trim().is_empty() {
            return Err(AgentPayError::invalid_input("tipper", "must not be empty"));
        }
        if params.amount.is_sign_negative() || params.amount.is_zero() {
            return Err(AgentPayError::invalid_input("amount", "must be positive"));
        }

        let tip = Tip {
            id: TipId::new(),
            repo,
            tipper: params.tipper,
            recipient,
            amount: params.amount,
            token: params.token,
            message: params.message,
            issue_url: params.issue_url,
            commit_ref: params.commit_ref,
            escrow_id: None,
            funding_hash: None,
            settlement: None,
            cancel_reason: None,
            state: TipState::Pending,
            timeline: TipTimeline::starting(Utc::now()),
        };

        {
            let mut tips = self.tips.write().await;
            tips.insert(tip.id.clone(), tip.clone());
            self.snapshot.save(&*tips)?;
        }

        info!(tip_id = %tip.id, repo = %tip.repo, amount = %tip.amount, "tip created");
        self.publish(
            EventType::TippingReceived,
            serde_json::json!({
                "tipId": tip.id.to_string(),
                "repo": tip.repo.to_string(),
                "tipper": tip.tipper,
                "recipient": tip.recipient.to_string(),
                "amount": tip.amount,
                "token": tip.token,
            }),
        )
        .await;
        Ok(tip)
    }

    /// Construct the carrying escrow through the supplied factory
    ///
    /// The factory runs outside the collection lock; if a concurrent caller
    /// advanced the tip meanwhile, the freshly created escrow is reported
    /// orphaned and the precondition failure surfaces.
    pub async fn create_escrow(&self, id: &TipId, factory: &dyn EscrowFactory) -> Result<Tip> {
        let tip = self.get(id).await?;
        Self::expect_state(&tip, TipState::Pending, "tip already has an escrow")?;

        let escrow_id = factory.create_escrow(&tip).await?;

        let updated = self
            .mutate(id, |tip| {
                if tip.state != TipState::Pending {
                    warn!(tip_id = %tip.id, escrow_id = %escrow_id, "escrow orphaned by concurrent transition");
                    return Err(AgentPayError::precondition(
                        tip.state.as_str(),
                        "tip already has an escrow",
                    ));
                }
                tip.escrow_id = Some(escrow_id.clone());
                tip.state = TipState::EscrowCreated;
                tip.timeline.escrow_created_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        info!(tip_id = %id, escrow_id = %escrow_id, "tip escrow created");
        Ok(updated)
    }

    /// Record that the carrying escrow was funded on-chain
    pub async fn fund_escrow(&self, id: &TipId, external_hash: &str) -> Result<Tip> {
        let updated = self
            .mutate(id, |tip| {
                Self::expect_state(tip, TipState::EscrowCreated, "tip escrow is not awaiting funding")?;
                tip.state = TipState::Funded;
                tip.funding_hash = Some(external_hash.to_string());
                tip.timeline.funded_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!(tip_id = %id, "tip funded");
        Ok(updated)
    }

    /// Record that the carrying escrow locked
    pub async fn lock_escrow(&self, id: &TipId) -> Result<Tip> {
        let updated = self
            .mutate(id, |tip| {
                Self::expect_state(tip, TipState::Funded, "tip is not funded")?;
                tip.state = TipState::Locked;
                tip.timeline.locked_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!(tip_id = %id, "tip locked");
        Ok(updated)
    }

    /// Record the on-chain settlement and release the tip
    pub async fn release_tip(
        &self,
        id: &TipId,
        tx_hash: &str,
        block_number: u64,
        gas_used: Option<u64>,
    ) -> Result<Tip> {
        let updated = self
            .mutate(id, |tip| {
                Self::expect_state(tip, TipState::Locked, "tip is not locked")?;
                let now = Utc::now();
                tip.state = TipState::Released;
                tip.settlement = Some(TipSettlement {
                    tx_hash: tx_hash.to_string(),
                    block_number,
                    gas_used,
                    settled_at: now,
                });
                tip.timeline.released_at = Some(now);
                Ok(())
            })
            .await?;

        info!(tip_id = %id, tx_hash, "tip released");
        self.publish(
            EventType::PaymentSettled,
            serde_json::json!({
                "tipId": updated.id.to_string(),
                "repo": updated.repo.to_string(),
                "recipient": updated.recipient.to_string(),
                "amount": updated.amount,
                "txHash": tx_hash,
                "blockNumber": block_number,
            }),
        )
        .await;
        Ok(updated)
    }

    /// Cancel a tip from any pre-released state
    pub async fn cancel_tip(&self, id: &TipId, reason: Option<String>) -> Result<Tip> {
        let updated = self
            .mutate(id, |tip| {
                if !tip.state.is_cancellable() {
                    return Err(AgentPayError::precondition(
                        tip.state.as_str(),
                        format!("cannot cancel in state {}", tip.state),
                    ));
                }
                tip.state = TipState::Cancelled;
                tip.cancel_reason = reason;
                tip.timeline.cancelled_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!(tip_id = %id, "tip cancelled");
        Ok(updated)
    }

    /// Drive the configured payment executor for a locked tip, then record
    /// the reported settlement
    ///
    /// Executor failures are non-fatal advisories: the tip stays locked and
    /// `None` is returned so the caller may retry.
    pub async fn settle_tip(&self, id: &TipId) -> Result<Option<Tip>> {
        let executor = self
            .executor
            .clone()
            .ok_or_else(|| AgentPayError::internal("no payment executor configured"))?;

        let tip = self.get(id).await?;
        Self::expect_state(&tip, TipState::Locked, "tip is not locked")?;
        let escrow_id = tip.escrow_id.clone().ok_or_else(|| {
            AgentPayError::precondition(tip.state.as_str(), "tip has no carrying escrow")
        })?;

        let outcome = executor
            .execute(PaymentRequest {
                kind: PaymentKind::Tip,
                tip_id: Some(tip.id.clone()),
                escrow_id,
                recipient: tip.recipient.to_string(),
                amount: tip.amount,
                token: tip.token,
            })
            .await;

        match outcome {
            Ok(outcome) => {
                let released = self
                    .release_tip(id, &outcome.tx_hash, outcome.block_number.unwrap_or_default(), None)
                    .await?;
                Ok(Some(released))
            }
            Err(err) => {
                warn!(tip_id = %id, error = %err, "payment executor failed; tip stays locked");
                Ok(None)
            }
        }
    }

    /// Tips in {funded, locked} matching the filters, with their sum, for a
    /// nightly settlement caller
    pub async fn process_batch(&self, filters: BatchFilters) -> TipBatch {
        let tips = self.tips.read().await;
        let mut matched: Vec<Tip> = tips
            .values()
            .filter(|t| matches!(t.state, TipState::Funded | TipState::Locked))
            .filter(|t| filters.repo.as_deref().map_or(true, |repo| t.repo.to_string() == repo))
            .filter(|t| filters.tipper.as_deref().map_or(true, |tipper| t.tipper == tipper))
            .filter(|t| filters.token.map_or(true, |token| t.token == token))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.timeline.created_at.cmp(&b.timeline.created_at));

        let total = matched.iter().map(|t| t.amount).sum();
        TipBatch {
            count: matched.len(),
            total,
            tips: matched,
        }
    }

    /// Aggregate for one repository
    pub async fn repo_stats(&self, repo: &str) -> RepoStats {
        let tips = self.tips.read().await;
        stats::repo_stats(repo, tips.values())
    }

    /// Aggregate for one tipper with their top `top_n` repositories
    pub async fn tipper_stats(&self, tipper: &str, top_n: usize) -> TipperStats {
        let tips = self.tips.read().await;
        stats::tipper_stats(tipper, top_n, tips.values())
    }

    /// System-wide aggregate with the top 10 repositories
    pub async fn global_stats(&self) -> GlobalStats {
        let tips = self.tips.read().await;
        stats::global_stats(tips.values())
    }

    /// Get a tip by id
    pub async fn get(&self, id: &TipId) -> Result<Tip> {
        self.tips
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentPayError::TipNotFound {
                tip_id: id.to_string(),
            })
    }

    /// All tips
    pub async fn list(&self) -> Vec<Tip> {
        self.tips.read().await.values().cloned().collect()
    }

    /// Tips in a given state
    pub async fn list_by_state(&self, state: TipState) -> Vec<Tip> {
        self.tips
            .read()
            .await
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect()
    }

    /// Tips attributed to a repository
    pub async fn list_by_repo(&self, repo: &str) -> Vec<Tip> {
        self.tips
            .read()
            .await
            .values()
            .filter(|t| t.repo.to_string() == repo)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    async fn mutate<F>(&self, id: &TipId, op: F) -> Result<Tip>
    where
        F: FnOnce(&mut Tip) -> Result<()>,
    {
        let mut tips = self.tips.write().await;
        let tip = tips.get_mut(id).ok_or_else(|| AgentPayError::TipNotFound {
            tip_id: id.to_string(),
        })?;
        op(tip)?;
        let tip = tip.clone();
        self.snapshot.save(&*tips)?;
        Ok(tip)
    }

    fn expect_state(tip: &Tip, expected: TipState, reason: &str) -> Result<()> {
        if tip.state != expected {
            return Err(AgentPayError::precondition(tip.state.as_str(), reason));
        }
        Ok(())
    }

    async fn publish(&self, event_type: EventType, data: serde_json::Value) {
        let context = serde_json::json!({ "source": "tipping" });
        if let Err(err) = self.publisher.emit(event_type, data, context).await {
            warn!(event_type = %event_type, error = %err, "event emit failed");
        }
    }
}
