//! End-to-end negotiation scenarios, including the escrow composition

use std::sync::Arc;

use agentpay_escrow::EscrowEngine;
use agentpay_negotiation::{CreateQuote, NegotiationEngine, QuoteState, QuoteTerms, TermsOverlay};
use agentpay_types::{EscrowState, Token};
use rust_decimal_macros::dec;

fn quote_params(terms: QuoteTerms) -> CreateQuote {
    CreateQuote {
        provider: "P".into(),
        client: "C".into(),
        service: "s".into(),
        price: dec!(100),
        token: Token::Native,
        terms,
        valid_for_minutes: 60,
    }
}

fn engines(dir: &std::path::Path) -> (Arc<EscrowEngine>, NegotiationEngine) {
    let escrow = Arc::new(EscrowEngine::load_detached(dir).unwrap());
    let negotiation = NegotiationEngine::load(dir, escrow.clone()).unwrap();
    (escrow, negotiation)
}

#[tokio::test]
async fn counter_offer_flow_constructs_escrow_at_agreed_price() {
    let dir = tempfile::tempdir().unwrap();
    let (escrow, negotiation) = engines(dir.path());

    let terms = QuoteTerms {
        delivery_time_minutes: Some(30),
        escrow_required: true,
        ..Default::default()
    };
    let quote = negotiation.create_quote(quote_params(terms)).await.unwrap();

    let countered = negotiation
        .counter_offer(&quote.id, "C", dec!(80), TermsOverlay::default())
        .await
        .unwrap();
    assert_eq!(countered.state, QuoteState::Countered);
    assert_eq!(countered.counters.len(), 1);

    let accepted = negotiation.accept_counter(&quote.id, "P", None).await.unwrap();
    assert_eq!(accepted.state, QuoteState::Accepted);
    assert_eq!(accepted.agreed_price, Some(dec!(80)));

    // the linked escrow mirrors the agreement: payer is the client, payee
    // is the provider, amount is the agreed price
    let escrow_id = accepted.escrow_id.expect("escrow was required");
    let record = escrow.get(&escrow_id).await.unwrap();
    assert_eq!(record.payer, "C");
    assert_eq!(record.payee, "P");
    assert_eq!(record.amount, dec!(80));
    assert_eq!(record.state, EscrowState::Pending);
    assert!(record.conditions.requires_approval);
    assert!(record.conditions.requires_delivery);
    assert!(record.conditions.requires_client_confirmation);
    assert!(record.timeout_at.is_some());
}

#[tokio::test]
async fn acceptance_without_escrow_when_terms_opt_out() {
    let dir = tempfile::tempdir().unwrap();
    let (escrow, negotiation) = engines(dir.path());

    let terms = QuoteTerms {
        escrow_required: false,
        ..Default::default()
    };
    let quote = negotiation.create_quote(quote_params(terms)).await.unwrap();
    let accepted = negotiation.accept(&quote.id, "C").await.unwrap();

    assert_eq!(accepted.agreed_price, Some(dec!(100)));
    assert!(accepted.escrow_id.is_none());
    assert!(escrow.list().await.is_empty());
}

#[tokio::test]
async fn delivery_and_client_confirmation_release_the_escrow() {
    let dir = tempfile::tempdir().unwrap();
    let (escrow, negotiation) = engines(dir.path());

    let quote = negotiation
        .create_quote(quote_params(QuoteTerms::default()))
        .await
        .unwrap();
    let accepted = negotiation.accept(&quote.id, "C").await.unwrap();
    let escrow_id = accepted.escrow_id.clone().unwrap();

    // the transport drives the escrow to locked
    escrow.fund(&escrow_id, "0xFUND").await.unwrap();
    escrow.approve(&escrow_id, "C").await.unwrap();
    escrow.approve(&escrow_id, "P").await.unwrap();

    // confirmation before delivery is rejected
    let err = negotiation.confirm_delivery(&quote.id, "C").await.unwrap_err();
    assert_eq!(err.error_code(), "PRECONDITION_VIOLATED");

    negotiation
        .mark_delivered(&quote.id, "P", serde_json::json!({"result": "done"}))
        .await
        .unwrap();
    let record = escrow.get(&escrow_id).await.unwrap();
    assert_eq!(record.state, EscrowState::Locked);
    assert!(record.delivery_proof.is_some());

    negotiation.confirm_delivery(&quote.id, "C").await.unwrap();
    let record = escrow.get(&escrow_id).await.unwrap();
    assert_eq!(record.state, EscrowState::Released);

    // confirming again tolerates the already-released escrow
    negotiation.confirm_delivery(&quote.id, "C").await.unwrap();
}

#[tokio::test]
async fn auto_release_terms_release_on_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let (escrow, negotiation) = engines(dir.path());

    let terms = QuoteTerms {
        auto_release: true,
        ..Default::default()
    };
    let quote = negotiation.create_quote(quote_params(terms)).await.unwrap();
    let accepted = negotiation.accept(&quote.id, "C").await.unwrap();
    let escrow_id = accepted.escrow_id.clone().unwrap();

    escrow.fund(&escrow_id, "0xFUND").await.unwrap();
    escrow.approve(&escrow_id, "C").await.unwrap();
    escrow.approve(&escrow_id, "P").await.unwrap();

    negotiation
        .mark_delivered(&quote.id, "P", serde_json::json!({"result": "done"}))
        .await
        .unwrap();

    let record = escrow.get(&escrow_id).await.unwrap();
    assert_eq!(record.state, EscrowState::Released);
    // a later confirmation is not an error
    negotiation.confirm_delivery(&quote.id, "C").await.unwrap();
}

#[tokio::test]
async fn quotes_rehydrate_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (_escrow, negotiation) = engines(dir.path());
        let quote = negotiation
            .create_quote(quote_params(QuoteTerms::default()))
            .await
            .unwrap();
        negotiation
            .counter_offer(&quote.id, "C", dec!(90), TermsOverlay::default())
            .await
            .unwrap();
        quote.id
    };

    let (_escrow, negotiation) = engines(dir.path());
    let quote = negotiation.get(&id).await.unwrap();
    assert_eq!(quote.state, QuoteState::Countered);
    assert_eq!(quote.counters.len(), 1);
    assert_eq!(quote.counters[0].price, dec!(90));
}
