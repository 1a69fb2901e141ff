//! AgentPay Negotiation - the quote lifecycle engine
//!
//! A provider opens a priced quote; the client accepts, rejects, or
//! counters; acceptance constructs an escrow through the escrow engine.
//! Every operation verifies the caller against the role recorded at quote
//! creation.
//!
//! The engine holds its own write lock while calling into the escrow
//! engine during acceptance. That is the one sanctioned cross-engine hold:
//! the escrow engine never calls back into negotiation, so the ordering is
//! acyclic.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use agentpay_types::{
    CounterOffer, CreateQuote, Quote, QuoteDelivery, QuoteId, QuoteState, QuoteTerms, TermsOverlay,
};

use agentpay_escrow::EscrowEngine;
use agentpay_store::JsonSnapshot;
use agentpay_types::{
    AgentPayError, CreateEscrow, EscrowConditions, EscrowId, EscrowState, Result,
};
use rust_decimal::Decimal;

/// Snapshot file name under the engine's data directory
const SNAPSHOT_FILE: &str = "quotes.json";

/// Escrow timeout slack beyond the promised delivery time, minutes
const TIMEOUT_SLACK_MINUTES: i64 = 30;

/// Escrow timeout when the terms name no delivery time, minutes
const DEFAULT_TIMEOUT_MINUTES: i64 = 120;

/// The negotiation engine
pub struct NegotiationEngine {
    quotes: Arc<RwLock<HashMap<QuoteId, Quote>>>,
    snapshot: JsonSnapshot,
    escrow: Arc<EscrowEngine>,
}

impl NegotiationEngine {
    /// Open the engine, rehydrating any persisted collection from `dir`
    pub fn load(dir: impl AsRef<Path>, escrow: Arc<EscrowEngine>) -> Result<Self> {
        let snapshot = JsonSnapshot::in_dir(dir, SNAPSHOT_FILE);
        let quotes: HashMap<QuoteId, Quote> = snapshot.load()?.unwrap_or_default();
        if !quotes.is_empty() {
            info!(count = quotes.len(), "quote collection rehydrated");
        }
        Ok(Self {
            quotes: Arc::new(RwLock::new(quotes)),
            snapshot,
            escrow,
        })
    }

    /// Open a quote from a provider to a client
    pub async fn create_quote(&self, params: CreateQuote) -> Result<Quote> {
        if params.provider.trim().is_empty() {
            return Err(AgentPayError::invalid_input("provider", "must not be empty"));
        }
        if params.client.trim().is_empty() {
            return Err(AgentPayError::invalid_input("client", "must not be empty"));
        }
        if params.price.is_sign_negative() || params.price.is_zero() {
            return Err(AgentPayError::invalid_input("price", "must be positive"));
        }
        if params.valid_for_minutes <= 0 {
            return Err(AgentPayError::invalid_input(
                "validForMinutes",
                "must be positive",
            ));
        }

        let now = Utc::now();
        let quote = Quote {
            id: QuoteId::new(),
            provider: params.provider,
            client: params.client,
            service: params.service,
            price: params.price,
            token: params.token,
            terms: params.terms,
            expires_at: now + Duration::minutes(params.valid_for_minutes),
            counters: Vec::new(),
            agreed_price: None,
            escrow_id: None,
            rejection_reason: None,
            delivery: None,
            state: QuoteState::Pending,
            created_at: now,
        };

        let mut quotes = self.quotes.write().await;
        quotes.insert(quote.id.clone(), quote.clone());
        self.snapshot.save(&*quotes)?;
        info!(quote_id = %quote.id, provider = %quote.provider, client = %quote.client, "quote created");
        Ok(quote)
    }

    /// Client accepts the quote at its base price
    pub async fn accept(&self, id: &QuoteId, client: &str) -> Result<Quote> {
        let now = Utc::now();
        let mut quotes = self.quotes.write().await;
        let quote = Self::lookup(&mut quotes, id)?;
        Self::ensure_client(quote, client)?;
        Self::expect_state(quote, QuoteState::Pending, "quote is not open for acceptance")?;
        Self::ensure_not_expired(quote, now)?;

        let agreed = quote.price;
        let terms = quote.terms.clone();
        let escrow_id = self.construct_escrow(quote, &terms, agreed).await?;

        let quote = Self::lookup(&mut quotes, id)?;
        quote.state = QuoteState::Accepted;
        quote.agreed_price = Some(agreed);
        quote.escrow_id = escrow_id;
        let accepted = quote.clone();
        self.snapshot.save(&*quotes)?;

        info!(quote_id = %id, agreed = %agreed, "quote accepted");
        Ok(accepted)
    }

    /// Client rejects a pending quote
    pub async fn reject(&self, id: &QuoteId, client: &str, reason: Option<String>) -> Result<Quote> {
        let mut quotes = self.quotes.write().await;
        let quote = Self::lookup(&mut quotes, id)?;
        Self::ensure_client(quote, client)?;
        Self::expect_state(quote, QuoteState::Pending, "quote is not open for rejection")?;

        quote.state = QuoteState::Rejected;
        quote.rejection_reason = reason;
        let rejected = quote.clone();
        self.snapshot.save(&*quotes)?;
        info!(quote_id = %id, "quote rejected");
        Ok(rejected)
    }

    /// Client proposes a new price and a terms overlay; counter-offers are
    /// append-only
    pub async fn counter_offer(
        &self,
        id: &QuoteId,
        client: &str,
        price: Decimal,
        terms: TermsOverlay,
    ) -> Result<Quote> {
        if price.is_sign_negative() || price.is_zero() {
            return Err(AgentPayError::invalid_input("price", "must be positive"));
        }

        let now = Utc::now();
        let mut quotes = self.quotes.write().await;
        let quote = Self::lookup(&mut quotes, id)?;
        Self::ensure_client(quote, client)?;
        if !matches!(quote.state, QuoteState::Pending | QuoteState::Countered) {
            return Err(AgentPayError::precondition(
                quote.state.as_str(),
                "quote is not open for counter-offers",
            ));
        }
        Self::ensure_not_expired(quote, now)?;

        quote.counters.push(CounterOffer {
            offered_by: client.to_string(),
            price,
            terms,
            offered_at: now,
        });
        quote.state = QuoteState::Countered;
        let countered = quote.clone();
        self.snapshot.save(&*quotes)?;
        info!(quote_id = %id, price = %price, round = countered.counters.len(), "counter-offer recorded");
        Ok(countered)
    }

    /// Provider accepts a counter-offer (the last one unless an index is
    /// given); the overlay merges into the terms and the counter price
    /// becomes the agreed price
    pub async fn accept_counter(
        &self,
        id: &QuoteId,
        provider: &str,
        index: Option<usize>,
    ) -> Result<Quote> {
        let mut quotes = self.quotes.write().await;
        let quote = Self::lookup(&mut quotes, id)?;
        Self::ensure_provider(quote, provider)?;
        Self::expect_state(quote, QuoteState::Countered, "quote has no open counter-offer")?;

        let index = index.unwrap_or(quote.counters.len().saturating_sub(1));
        let counter = quote.counters.get(index).cloned().ok_or_else(|| {
            AgentPayError::precondition(
                quote.state.as_str(),
                format!("no counter-offer at index {index}"),
            )
        })?;

        let mut terms = quote.terms.clone();
        terms.apply(&counter.terms);
        let agreed = counter.price;

        let escrow_id = self.construct_escrow(quote, &terms, agreed).await?;

        let quote = Self::lookup(&mut quotes, id)?;
        quote.terms = terms;
        quote.state = QuoteState::Accepted;
        quote.agreed_price = Some(agreed);
        quote.escrow_id = escrow_id;
        let accepted = quote.clone();
        self.snapshot.save(&*quotes)?;

        info!(quote_id = %id, agreed = %agreed, "counter-offer accepted");
        Ok(accepted)
    }

    /// Provider records delivery; forwards the proof to the linked escrow,
    /// and releases it outright when the terms auto-release
    pub async fn mark_delivered(
        &self,
        id: &QuoteId,
        provider: &str,
        proof: serde_json::Value,
    ) -> Result<Quote> {
        let (delivered, escrow_id, auto_release) = {
            let mut quotes = self.quotes.write().await;
            let quote = Self::lookup(&mut quotes, id)?;
            Self::ensure_provider(quote, provider)?;
            Self::expect_state(quote, QuoteState::Accepted, "quote is not accepted")?;

            quote.delivery = Some(QuoteDelivery {
                delivered_at: Utc::now(),
                proof: proof.clone(),
            });
            let delivered = quote.clone();
            let escrow_id = quote.escrow_id.clone();
            let auto_release = quote.terms.auto_release;
            self.snapshot.save(&*quotes)?;
            (delivered, escrow_id, auto_release)
        };

        if let Some(escrow_id) = escrow_id {
            self.escrow
                .submit_delivery(&escrow_id, provider, proof, None)
                .await?;
            if auto_release {
                let escrow = self.escrow.get(&escrow_id).await?;
                if escrow.state == EscrowState::Locked {
                    self.escrow
                        .release(&escrow_id, "automatic - delivery confirmed")
                        .await?;
                }
            }
        }

        info!(quote_id = %id, "delivery marked");
        Ok(delivered)
    }

    /// Client confirms delivery; releases the linked escrow if it is still
    /// locked (a prior auto-release is not an error)
    pub async fn confirm_delivery(&self, id: &QuoteId, client: &str) -> Result<Quote> {
        let (quote, escrow_id) = {
            let quotes = self.quotes.read().await;
            let quote = quotes.get(id).ok_or_else(|| AgentPayError::QuoteNotFound {
                quote_id: id.to_string(),
            })?;
            Self::ensure_client(quote, client)?;
            if quote.delivery.is_none() {
                return Err(AgentPayError::precondition(
                    quote.state.as_str(),
                    "no delivery has been recorded",
                ));
            }
            (quote.clone(), quote.escrow_id.clone())
        };

        if let Some(escrow_id) = escrow_id {
            let escrow = self.escrow.get(&escrow_id).await?;
            if escrow.state == EscrowState::Locked {
                self.escrow
                    .release(&escrow_id, "client confirmed delivery")
                    .await?;
                info!(quote_id = %id, escrow_id = %escrow_id, "escrow released on confirmation");
            }
        }

        Ok(quote)
    }

    /// Expire every pending quote past its expiry
    pub async fn process_expirations(&self) -> Result<Vec<QuoteId>> {
        let now = Utc::now();
        let mut expired = Vec::new();

        let mut quotes = self.quotes.write().await;
        for quote in quotes.values_mut() {
            if quote.state == QuoteState::Pending && now > quote.expires_at {
                quote.state = QuoteState::Expired;
                expired.push(quote.id.clone());
            }
        }
        if !expired.is_empty() {
            self.snapshot.save(&*quotes)?;
            info!(count = expired.len(), "quotes expired");
        }
        Ok(expired)
    }

    /// Get a quote by id
    pub async fn get(&self, id: &QuoteId) -> Result<Quote> {
        self.quotes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentPayError::QuoteNotFound {
                quote_id: id.to_string(),
            })
    }

    /// All quotes
    pub async fn list(&self) -> Vec<Quote> {
        self.quotes.read().await.values().cloned().collect()
    }

    /// Quotes in a given state
    pub async fn list_by_state(&self, state: QuoteState) -> Vec<Quote> {
        self.quotes
            .read()
            .await
            .values()
            .filter(|q| q.state == state)
            .cloned()
            .collect()
    }

    /// Quotes opened by a provider
    pub async fn list_by_provider(&self, provider: &str) -> Vec<Quote> {
        self.quotes
            .read()
            .await
            .values()
            .filter(|q| q.provider == provider)
            .cloned()
            .collect()
    }

    /// Quotes addressed to a client
    pub async fn list_by_client(&self, client: &str) -> Vec<Quote> {
        self.quotes
            .read()
            .await
            .values()
            .filter(|q| q.client == client)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Create the escrow backing an accepted quote, when the terms require
    /// one. Conditions derive from the terms; the timeout allows the
    /// promised delivery time plus slack.
    async fn construct_escrow(
        &self,
        quote: &Quote,
        terms: &QuoteTerms,
        agreed: Decimal,
    ) -> Result<Option<EscrowId>> {
        if !terms.escrow_required {
            return Ok(None);
        }

        let timeout_minutes = terms
            .delivery_time_minutes
            .map(|minutes| minutes + TIMEOUT_SLACK_MINUTES)
            .unwrap_or(DEFAULT_TIMEOUT_MINUTES);

        let escrow = self
            .escrow
            .create(CreateEscrow {
                payer: quote.client.clone(),
                payee: quote.provider.clone(),
                amount: agreed,
                purpose: format!("negotiated service: {}", quote.service),
                token: quote.token,
                conditions: EscrowConditions {
                    requires_approval: true,
                    requires_delivery: true,
                    requires_arbiter: terms.requires_arbiter,
                    requires_client_confirmation: !terms.auto_release,
                },
                timeout_minutes: Some(timeout_minutes),
            })
            .await?;

        info!(quote_id = %quote.id, escrow_id = %escrow.id, "escrow constructed for acceptance");
        Ok(Some(escrow.id))
    }

    fn lookup<'a>(
        quotes: &'a mut HashMap<QuoteId, Quote>,
        id: &QuoteId,
    ) -> Result<&'a mut Quote> {
        quotes.get_mut(id).ok_or_else(|| AgentPayError::QuoteNotFound {
            quote_id: id.to_string(),
        })
    }

    fn ensure_client(quote: &Quote, caller: &str) -> Result<()> {
        if quote.client != caller {
            warn!(quote_id = %quote.id, caller, "caller is not the client");
            return Err(AgentPayError::unauthorized(format!(
                "caller {caller} is not the client of quote {}",
                quote.id
            )));
        }
        Ok(())
    }

    fn ensure_provider(quote: &Quote, caller: &str) -> Result<()> {
        if quote.provider != caller {
            warn!(quote_id = %quote.id, caller, "caller is not the provider");
            return Err(AgentPayError::unauthorized(format!(
                "caller {caller} is not the provider of quote {}",
                quote.id
            )));
        }
        Ok(())
    }

    fn expect_state(quote: &Quote, expected: QuoteState, reason: &str) -> Result<()> {
        if quote.state != expected {
            return Err(AgentPayError::precondition(quote.state.as_str(), reason));
        }
        Ok(())
    }

    /// Acceptance at exactly the expiry instant still succeeds; one
    /// millisecond later it does not
    fn ensure_not_expired(quote: &Quote, now: DateTime<Utc>) -> Result<()> {
        if now > quote.expires_at {
            return Err(AgentPayError::precondition(quote.state.as_str(), "quote expired"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpay_types::Token;
    use rust_decimal_macros::dec;

    fn create_params() -> CreateQuote {
        CreateQuote {
            provider: "P".into(),
            client: "C".into(),
            service: "s".into(),
            price: dec!(100),
            token: Token::Native,
            terms: QuoteTerms::default(),
            valid_for_minutes: 60,
        }
    }

    async fn engine(dir: &Path) -> NegotiationEngine {
        let escrow = Arc::new(EscrowEngine::load_detached(dir).unwrap());
        NegotiationEngine::load(dir, escrow).unwrap()
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let mut quote = Quote {
            id: QuoteId::new(),
            provider: "P".into(),
            client: "C".into(),
            service: "s".into(),
            price: dec!(100),
            token: Token::Native,
            terms: QuoteTerms::default(),
            expires_at: now,
            counters: Vec::new(),
            agreed_price: None,
            escrow_id: None,
            rejection_reason: None,
            delivery: None,
            state: QuoteState::Pending,
            created_at: now,
        };

        // acceptance at exactly expiry succeeds
        assert!(NegotiationEngine::ensure_not_expired(&quote, now).is_ok());
        // one millisecond later it does not
        let late = now + Duration::milliseconds(1);
        assert!(NegotiationEngine::ensure_not_expired(&quote, late).is_err());

        quote.expires_at = now - Duration::milliseconds(1);
        assert!(NegotiationEngine::ensure_not_expired(&quote, now).is_err());
    }

    #[tokio::test]
    async fn test_expired_quote_rejects_acceptance() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let quote = engine.create_quote(create_params()).await.unwrap();

        engine
            .quotes
            .write()
            .await
            .get_mut(&quote.id)
            .unwrap()
            .expires_at = Utc::now() - Duration::minutes(1);

        let err = engine.accept(&quote.id, "C").await.unwrap_err();
        assert_eq!(err.error_code(), "PRECONDITION_VIOLATED");
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_authorization_is_role_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let quote = engine.create_quote(create_params()).await.unwrap();

        // the provider cannot accept its own quote
        let err = engine.accept(&quote.id, "P").await.unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");

        // a stranger cannot counter
        let err = engine
            .counter_offer(&quote.id, "X", dec!(80), TermsOverlay::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");

        // the client cannot accept a counter
        engine
            .counter_offer(&quote.id, "C", dec!(80), TermsOverlay::default())
            .await
            .unwrap();
        let err = engine.accept_counter(&quote.id, "C", None).await.unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_process_expirations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let quote = engine.create_quote(create_params()).await.unwrap();
        let fresh = engine.create_quote(create_params()).await.unwrap();

        engine
            .quotes
            .write()
            .await
            .get_mut(&quote.id)
            .unwrap()
            .expires_at = Utc::now() - Duration::minutes(1);

        let expired = engine.process_expirations().await.unwrap();
        assert_eq!(expired, vec![quote.id.clone()]);
        assert_eq!(engine.get(&quote.id).await.unwrap().state, QuoteState::Expired);
        assert_eq!(engine.get(&fresh.id).await.unwrap().state, QuoteState::Pending);

        // nothing left to expire
        assert!(engine.process_expirations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_records_reason() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let quote = engine.create_quote(create_params()).await.unwrap();

        let rejected = engine
            .reject(&quote.id, "C", Some("too expensive".into()))
            .await
            .unwrap();
        assert_eq!(rejected.state, QuoteState::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("too expensive"));

        // terminal: no counter-offers afterwards
        let err = engine
            .counter_offer(&quote.id, "C", dec!(50), TermsOverlay::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PRECONDITION_VIOLATED");
    }
}
