//! Delivery engine configuration

use agentpay_types::{AgentPayError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Configuration for the webhook delivery engine
///
/// Deserialization rejects unknown options; missing options fall back to
/// the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WebhookConfig {
    /// Attempts per delivery before it is dropped
    pub max_retries: u32,
    /// Backoff after the first failed attempt, milliseconds
    pub initial_delay_ms: u64,
    /// Backoff cap, milliseconds
    pub max_delay_ms: u64,
    /// Backoff growth factor per attempt
    pub backoff_multiplier: f64,
    /// Outgoing POST timeout, milliseconds
    pub request_timeout_ms: u64,
    /// Event log entries kept; older entries truncate from the head
    pub max_log_entries: usize,
    /// Periodic queue checkpoint interval, milliseconds
    pub queue_checkpoint_interval_ms: u64,
    /// Concurrent deliveries per batch
    pub delivery_fan_out: usize,
    /// Delivery worker tick, milliseconds
    pub worker_tick_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 3_600_000,
            backoff_multiplier: 2.0,
            request_timeout_ms: 10_000,
            max_log_entries: 10_000,
            queue_checkpoint_interval_ms: 5_000,
            delivery_fan_out: 5,
            worker_tick_ms: 1_000,
        }
    }
}

impl WebhookConfig {
    /// Reject values the delivery loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(AgentPayError::invalid_input("maxRetries", "must be at least 1"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(AgentPayError::invalid_input(
                "backoffMultiplier",
                "must be at least 1",
            ));
        }
        if self.delivery_fan_out == 0 {
            return Err(AgentPayError::invalid_input("deliveryFanOut", "must be at least 1"));
        }
        if self.worker_tick_ms == 0 {
            return Err(AgentPayError::invalid_input("workerTickMs", "must be positive"));
        }
        if self.queue_checkpoint_interval_ms == 0 {
            return Err(AgentPayError::invalid_input(
                "queueCheckpointIntervalMs",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Backoff before the attempt after `failed_attempt`:
    /// `min(initial × multiplier^(failed_attempt - 1), max)`
    pub fn retry_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::milliseconds(capped as i64)
    }
}
