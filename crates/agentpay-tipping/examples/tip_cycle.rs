//! Drives one tip through its full cycle:
//! create → escrow → fund → lock → settle, with webhook deliveries queued
//! along the way.
//!
//! Run with: cargo run --example tip_cycle

use std::sync::Arc;

use agentpay_escrow::EscrowEngine;
use agentpay_tipping::{CreateTip, TipEscrowFactory, TippingEngine};
use agentpay_types::{MockExecutor, Token};
use agentpay_webhooks::{RegisterOptions, WebhookConfig, WebhookEngine};
use rust_decimal::Decimal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let data_dir = tempfile::tempdir()?;
    println!("data dir: {}", data_dir.path().display());

    // the webhook engine doubles as the event publisher for the other engines
    let webhooks = WebhookEngine::load(data_dir.path(), WebhookConfig::default())?;
    let registered = webhooks
        .register(
            "https://example.com/hooks/agentpay",
            &["tipping_received".into(), "payment_settled".into()],
            RegisterOptions::default(),
        )
        .await?;
    println!("subscription {} (secret issued once)", registered.id);

    let escrow = Arc::new(EscrowEngine::load(
        data_dir.path(),
        Arc::new(webhooks.clone()),
    )?);
    let tipping = TippingEngine::load(data_dir.path(), Arc::new(webhooks.clone()))?
        .with_executor(Arc::new(MockExecutor::new()));

    // create → escrow → fund → lock → settle
    let tip = tipping
        .create_tip(CreateTip {
            repo: "octo-org/payments".into(),
            tipper: "agent-alpha".into(),
            recipient: "octocat".into(),
            amount: Decimal::from(25),
            token: Token::Native,
            message: Some("thanks for the fix".into()),
            issue_url: None,
            commit_ref: None,
        })
        .await?;
    println!("tip {} created for {}", tip.id, tip.repo);

    let factory = TipEscrowFactory::new(escrow.clone());
    let tip = tipping.create_escrow(&tip.id, &factory).await?;
    let escrow_id = tip.escrow_id.clone().expect("escrow linked");
    println!("escrow {escrow_id} carries the tip");

    tipping.fund_escrow(&tip.id, "0xFUNDHASH").await?;
    tipping.lock_escrow(&tip.id).await?;
    let settled = tipping.settle_tip(&tip.id).await?.expect("executor settled");
    println!(
        "tip released: tx {}",
        settled.settlement.expect("settlement recorded").tx_hash
    );

    let stats = tipping.global_stats().await;
    println!(
        "global stats: {} tip(s), {} total",
        stats.total_tips, stats.total_amount
    );

    // deliveries wait in the durable queue until a worker drains them
    println!("queued deliveries: {}", webhooks.queue_len().await);
    for entry in webhooks.recent_log(5).await {
        println!("log: [{}] {}", entry.kind, entry.detail);
    }

    webhooks.shutdown().await;
    Ok(())
}
