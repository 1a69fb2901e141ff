//! End-to-end tipping scenarios

use std::sync::Arc;

use agentpay_escrow::EscrowEngine;
use agentpay_tipping::{
    BatchFilters, CreateTip, EscrowFactory, TipEscrowFactory, TipState, TippingEngine,
};
use agentpay_types::{
    EscrowState, EventType, MemoryPublisher, MockExecutor, PaymentExecutor, PaymentRequest,
    Result, Token,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn tip_params() -> CreateTip {
    CreateTip {
        repo: "o/r".into(),
        tipper: "T".into(),
        recipient: "R".into(),
        amount: dec!(10),
        token: Token::Native,
        message: None,
        issue_url: None,
        commit_ref: None,
    }
}

#[tokio::test]
async fn full_tip_flow_with_escrow_and_stats() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(MemoryPublisher::new());
    let escrow = Arc::new(EscrowEngine::load_detached(dir.path()).unwrap());
    let engine = TippingEngine::load(dir.path(), publisher.clone()).unwrap();
    let factory = TipEscrowFactory::new(escrow.clone());

    let tip = engine.create_tip(tip_params()).await.unwrap();
    assert_eq!(tip.state, TipState::Pending);

    let tip = engine.create_escrow(&tip.id, &factory).await.unwrap();
    assert_eq!(tip.state, TipState::EscrowCreated);
    let escrow_id = tip.escrow_id.clone().expect("escrow linked");

    // the carrying escrow mirrors the tip
    let record = escrow.get(&escrow_id).await.unwrap();
    assert_eq!(record.payer, "T");
    assert_eq!(record.payee, "R");
    assert_eq!(record.amount, dec!(10));
    assert_eq!(record.state, EscrowState::Pending);

    engine.fund_escrow(&tip.id, "0xA").await.unwrap();
    engine.lock_escrow(&tip.id).await.unwrap();
    let released = engine.release_tip(&tip.id, "0xB", 123, Some(50_000)).await.unwrap();
    assert_eq!(released.state, TipState::Released);

    let settlement = released.settlement.expect("settlement recorded");
    assert_eq!(settlement.tx_hash, "0xB");
    assert_eq!(settlement.block_number, 123);
    assert_eq!(settlement.gas_used, Some(50_000));

    // stats
    let global = engine.global_stats().await;
    assert_eq!(global.total_tips, 1);
    assert_eq!(global.total_amount, dec!(10));
    assert_eq!(global.by_token["primary-native"].count, 1);
    assert_eq!(global.top_repos[0].repo, "o/r");

    let repo = engine.repo_stats("o/r").await;
    assert_eq!(repo.count, 1);
    assert_eq!(repo.average, dec!(10));
    assert_eq!(repo.by_state["released"], 1);

    // events: tipping_received at creation, payment_settled at release
    assert_eq!(
        publisher.event_types().await,
        vec![EventType::TippingReceived, EventType::PaymentSettled]
    );
}

#[tokio::test]
async fn recipient_boundary_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TippingEngine::load_detached(dir.path()).unwrap();

    let mut at_limit = tip_params();
    at_limit.recipient = "a".repeat(39);
    assert!(engine.create_tip(at_limit).await.is_ok());

    let mut over_limit = tip_params();
    over_limit.recipient = "a".repeat(40);
    let err = engine.create_tip(over_limit).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");

    let mut address = tip_params();
    address.recipient = format!("0x{}", "ab".repeat(20));
    assert!(engine.create_tip(address).await.is_ok());
}

#[tokio::test]
async fn amount_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TippingEngine::load_detached(dir.path()).unwrap();

    let mut smallest = tip_params();
    smallest.amount = Decimal::new(1, 28);
    assert!(engine.create_tip(smallest).await.is_ok());

    let mut zero = tip_params();
    zero.amount = Decimal::ZERO;
    assert!(engine.create_tip(zero).await.is_err());

    let mut negative = tip_params();
    negative.amount = dec!(-1);
    assert!(engine.create_tip(negative).await.is_err());
}

#[tokio::test]
async fn cancel_is_allowed_until_release() {
    let dir = tempfile::tempdir().unwrap();
    let escrow = Arc::new(EscrowEngine::load_detached(dir.path()).unwrap());
    let engine = TippingEngine::load_detached(dir.path()).unwrap();
    let factory = TipEscrowFactory::new(escrow);

    let tip = engine.create_tip(tip_params()).await.unwrap();
    engine.create_escrow(&tip.id, &factory).await.unwrap();
    engine.fund_escrow(&tip.id, "0xA").await.unwrap();
    engine.lock_escrow(&tip.id).await.unwrap();

    let cancelled = engine
        .cancel_tip(&tip.id, Some("tipper withdrew".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.state, TipState::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("tipper withdrew"));

    // cancelling a terminal tip carries the offending state in the error
    let err = engine.cancel_tip(&tip.id, None).await.unwrap_err();
    assert!(err.to_string().contains("cannot cancel in state cancelled"));
}

#[tokio::test]
async fn released_tip_cannot_cancel_or_advance() {
    let dir = tempfile::tempdir().unwrap();
    let escrow = Arc::new(EscrowEngine::load_detached(dir.path()).unwrap());
    let engine = TippingEngine::load_detached(dir.path()).unwrap();
    let factory = TipEscrowFactory::new(escrow);

    let tip = engine.create_tip(tip_params()).await.unwrap();
    engine.create_escrow(&tip.id, &factory).await.unwrap();
    engine.fund_escrow(&tip.id, "0xA").await.unwrap();
    engine.lock_escrow(&tip.id).await.unwrap();
    engine.release_tip(&tip.id, "0xB", 1, None).await.unwrap();

    assert!(engine.cancel_tip(&tip.id, None).await.is_err());
    assert!(engine.release_tip(&tip.id, "0xC", 2, None).await.is_err());
    assert_eq!(engine.get(&tip.id).await.unwrap().state, TipState::Released);
}

#[tokio::test]
async fn process_batch_filters_funded_and_locked() {
    let dir = tempfile::tempdir().unwrap();
    let escrow = Arc::new(EscrowEngine::load_detached(dir.path()).unwrap());
    let engine = TippingEngine::load_detached(dir.path()).unwrap();
    let factory = TipEscrowFactory::new(escrow);

    // one pending, one funded, one locked, one released
    let pending = engine.create_tip(tip_params()).await.unwrap();
    let _ = pending;

    let funded = engine.create_tip(tip_params()).await.unwrap();
    engine.create_escrow(&funded.id, &factory).await.unwrap();
    engine.fund_escrow(&funded.id, "0x1").await.unwrap();

    let locked = engine.create_tip(tip_params()).await.unwrap();
    engine.create_escrow(&locked.id, &factory).await.unwrap();
    engine.fund_escrow(&locked.id, "0x2").await.unwrap();
    engine.lock_escrow(&locked.id).await.unwrap();

    let released = engine.create_tip(tip_params()).await.unwrap();
    engine.create_escrow(&released.id, &factory).await.unwrap();
    engine.fund_escrow(&released.id, "0x3").await.unwrap();
    engine.lock_escrow(&released.id).await.unwrap();
    engine.release_tip(&released.id, "0x4", 9, None).await.unwrap();

    let batch = engine.process_batch(BatchFilters::default()).await;
    assert_eq!(batch.count, 2);
    assert_eq!(batch.total, dec!(20));

    let filtered = engine
        .process_batch(BatchFilters {
            token: Some(Token::Stable),
            ..Default::default()
        })
        .await;
    assert_eq!(filtered.count, 0);
}

#[tokio::test]
async fn settle_tip_drives_the_executor() {
    let dir = tempfile::tempdir().unwrap();
    let escrow = Arc::new(EscrowEngine::load_detached(dir.path()).unwrap());
    let executor = Arc::new(MockExecutor::new());
    let engine = TippingEngine::load_detached(dir.path())
        .unwrap()
        .with_executor(executor.clone());
    let factory = TipEscrowFactory::new(escrow);

    let tip = engine.create_tip(tip_params()).await.unwrap();
    engine.create_escrow(&tip.id, &factory).await.unwrap();
    engine.fund_escrow(&tip.id, "0xA").await.unwrap();
    engine.lock_escrow(&tip.id).await.unwrap();

    let settled = engine.settle_tip(&tip.id).await.unwrap().expect("settled");
    assert_eq!(settled.state, TipState::Released);
    assert!(settled.settlement.is_some());

    let requests = executor.executed().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].recipient, "R");
    assert_eq!(requests[0].amount, dec!(10));
}

/// Executor that always fails, to observe the advisory semantics
struct FailingExecutor;

#[async_trait]
impl PaymentExecutor for FailingExecutor {
    async fn execute(&self, _request: PaymentRequest) -> Result<agentpay_types::PaymentOutcome> {
        Err(agentpay_types::AgentPayError::internal("chain unavailable"))
    }
}

#[tokio::test]
async fn executor_failure_is_a_non_fatal_advisory() {
    let dir = tempfile::tempdir().unwrap();
    let escrow = Arc::new(EscrowEngine::load_detached(dir.path()).unwrap());
    let engine = TippingEngine::load_detached(dir.path())
        .unwrap()
        .with_executor(Arc::new(FailingExecutor));
    let factory = TipEscrowFactory::new(escrow);

    let tip = engine.create_tip(tip_params()).await.unwrap();
    engine.create_escrow(&tip.id, &factory).await.unwrap();
    engine.fund_escrow(&tip.id, "0xA").await.unwrap();
    engine.lock_escrow(&tip.id).await.unwrap();

    let outcome = engine.settle_tip(&tip.id).await.unwrap();
    assert!(outcome.is_none());
    // the tip stays locked; the caller may retry
    assert_eq!(engine.get(&tip.id).await.unwrap().state, TipState::Locked);
}

#[tokio::test]
async fn tipper_stats_rank_repositories() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TippingEngine::load_detached(dir.path()).unwrap();

    for (repo, amount) in [("o/a", dec!(5)), ("o/b", dec!(20)), ("o/a", dec!(10))] {
        let mut params = tip_params();
        params.repo = repo.into();
        params.amount = amount;
        engine.create_tip(params).await.unwrap();
    }

    let stats = engine.tipper_stats("T", 2).await;
    assert_eq!(stats.count, 3);
    assert_eq!(stats.total, dec!(35));
    assert_eq!(stats.top_repos[0].repo, "o/b");
    assert_eq!(stats.top_repos[0].total, dec!(20));
    assert_eq!(stats.top_repos[1].repo, "o/a");
    assert_eq!(stats.top_repos[1].total, dec!(15));
}
