//! Error types for AgentPay
//!
//! Every rejected operation is reported to the caller; nothing is silently
//! skipped. Transient delivery failures are the one exception - they are
//! absorbed by the webhook engine and surfaced through counters and the
//! event log.

use thiserror::Error;

/// Result type for AgentPay operations
pub type Result<T> = std::result::Result<T, AgentPayError>;

/// AgentPay error types
#[derive(Debug, Clone, Error)]
pub enum AgentPayError {
    // ========================================================================
    // Input Errors
    // ========================================================================

    /// Syntactic failure: malformed URL, bad repo reference, non-positive
    /// amount, unsupported token
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    /// Caller identifier does not match the required role
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    // ========================================================================
    // State Errors
    // ========================================================================

    /// Current state rejects the operation
    #[error("Precondition violated (state {state}): {reason}")]
    PreconditionViolated { state: String, reason: String },

    /// Escrow not found
    #[error("Escrow {escrow_id} not found")]
    EscrowNotFound { escrow_id: String },

    /// Quote not found
    #[error("Quote {quote_id} not found")]
    QuoteNotFound { quote_id: String },

    /// Tip not found
    #[error("Tip {tip_id} not found")]
    TipNotFound { tip_id: String },

    /// Subscription not found
    #[error("Subscription {subscription_id} not found")]
    SubscriptionNotFound { subscription_id: String },

    // ========================================================================
    // Event Errors
    // ========================================================================

    /// Event tag not in the closed set
    #[error("Invalid event type: {event_type}")]
    InvalidEventType { event_type: String },

    /// Subscription filter is empty after intersection with the closed set
    #[error("No valid event types in subscription filter")]
    NoValidEventTypes,

    // ========================================================================
    // General Errors
    // ========================================================================

    /// Snapshot read/write failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentPayError {
    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create a precondition error carrying the current state for diagnostics
    pub fn precondition(state: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreconditionViolated {
            state: state.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get an error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::PreconditionViolated { .. } => "PRECONDITION_VIOLATED",
            Self::EscrowNotFound { .. } => "ESCROW_NOT_FOUND",
            Self::QuoteNotFound { .. } => "QUOTE_NOT_FOUND",
            Self::TipNotFound { .. } => "TIP_NOT_FOUND",
            Self::SubscriptionNotFound { .. } => "SUBSCRIPTION_NOT_FOUND",
            Self::InvalidEventType { .. } => "INVALID_EVENT_TYPE",
            Self::NoValidEventTypes => "NO_VALID_EVENT_TYPES",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
