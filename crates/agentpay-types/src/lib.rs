//! AgentPay Types - Canonical domain types for agent-to-agent payments
//!
//! This crate contains all foundational types for AgentPay with zero
//! dependencies on other agentpay crates. It defines the complete type
//! system for:
//!
//! - Identity types (EscrowId, QuoteId, TipId, SubscriptionId, EventId)
//! - Settlement tokens and display-unit amounts
//! - Escrow state machine types
//! - Negotiation quote types
//! - Repository tip types
//! - Webhook subscription, event, and delivery types
//! - The event publication and payment executor seams
//!
//! # Architectural Invariants
//!
//! 1. States and event types are closed enums; strings exist only at the
//!    persistence and wire boundary
//! 2. Cross-entity references are by id only; the referring engine never
//!    mutates the referenced entity directly
//! 3. Terminal records are never destroyed - they are the audit trail

pub mod error;
pub mod escrow;
pub mod events;
pub mod executor;
pub mod identity;
pub mod quote;
pub mod tip;
pub mod token;
pub mod webhook;

pub use error::*;
pub use escrow::*;
pub use events::*;
pub use executor::*;
pub use identity::*;
pub use quote::*;
pub use tip::*;
pub use token::*;
pub use webhook::*;

/// Version of the AgentPay types schema
pub const TYPES_VERSION: &str = "0.1.0";
