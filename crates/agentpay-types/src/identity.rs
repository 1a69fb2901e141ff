//! Identity types for AgentPay
//!
//! Entity identifiers are strongly typed wrappers around UUIDs to prevent
//! accidental mixing of different ID types. Party identifiers (payer, payee,
//! provider, client, tipper, approvers) are caller-supplied opaque strings
//! and stay `String` throughout.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

// Entity identity types
define_id_type!(EscrowId, "escrow", "Unique identifier for an escrow");
define_id_type!(QuoteId, "quote", "Unique identifier for a negotiation quote");
define_id_type!(TipId, "tip", "Unique identifier for a repository tip");
define_id_type!(SubscriptionId, "sub", "Unique identifier for a webhook subscription");
define_id_type!(EventId, "evt", "Unique identifier for an emitted event");
