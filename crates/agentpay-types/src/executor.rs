//! Payment executor collaborator contract
//!
//! The core never constructs or signs chain transactions. An executor is an
//! optional collaborator that performs a transfer and reports the resulting
//! hash; its errors are non-fatal advisories - the paying entity stays at
//! its current state and the caller may retry.

use crate::{EscrowId, Result, TipId, Token};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What kind of settlement a request pays out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Tip,
    Escrow,
}

/// A transfer request handed to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub kind: PaymentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tip_id: Option<TipId>,
    pub escrow_id: EscrowId,
    pub recipient: String,
    pub amount: Decimal,
    pub token: Token,
}

/// The executor's report of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub tx_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// On-chain transfer collaborator
#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    async fn execute(&self, request: PaymentRequest) -> Result<PaymentOutcome>;
}

/// In-memory executor for tests and demos; records every request and
/// fabricates deterministic hashes
#[derive(Default)]
pub struct MockExecutor {
    executed: Arc<Mutex<Vec<PaymentRequest>>>,
    sequence: AtomicU64,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests executed so far, in order
    pub async fn executed(&self) -> Vec<PaymentRequest> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl PaymentExecutor for MockExecutor {
    async fn execute(&self, request: PaymentRequest) -> Result<PaymentOutcome> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.executed.lock().await.push(request);
        Ok(PaymentOutcome {
            tx_hash: format!("0x{sequence:064x}"),
            block_number: Some(sequence),
        })
    }
}
