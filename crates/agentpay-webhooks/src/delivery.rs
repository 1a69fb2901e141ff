//! The delivery worker
//!
//! One cooperative task drives both the delivery tick and the periodic
//! queue checkpoint. Each pass takes the due slice out of the queue,
//! processes it with bounded fan-out, reschedules transient failures with
//! exponential backoff, and checkpoints. Because the pass runs inline in
//! the loop, shutdown naturally waits for the in-flight batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use agentpay_store::LogEntry;
use agentpay_types::{AgentPayError, Delivery, DeliveryStatus, Result, Subscription, WebhookEvent};

use crate::signal::WebhookSignal;
use crate::signer;
use crate::EngineInner;

/// Outcome of one delivery attempt
enum Outcome {
    /// 2xx response
    Delivered { delivery: Delivery },
    /// Transient failure, rescheduled
    Retry { delivery: Delivery, reason: String },
    /// Attempts exhausted, dropped
    Exhausted { delivery: Delivery, reason: String },
    /// Subscription no longer exists; nothing to deliver to
    Orphaned,
}

pub(crate) fn spawn_worker(
    inner: Arc<EngineInner>,
    mut stop_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_millis(inner.config.worker_tick_ms));
        let mut checkpoint = interval(Duration::from_millis(
            inner.config.queue_checkpoint_interval_ms,
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // both intervals fire once immediately; drain those so the first
        // real pass lands one tick in
        tick.tick().await;
        checkpoint.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tick.tick() => inner.process_due().await,
                _ = checkpoint.tick() => inner.checkpoint_queue().await,
            }
        }
    })
}

impl EngineInner {
    /// One queue pass: partition due from pending, process due with bounded
    /// fan-out, apply counters, reschedule, checkpoint, signal
    pub(crate) async fn process_due(&self) {
        let now = Utc::now();
        let due: Vec<Delivery> = {
            let mut queue = self.queue.lock().await;
            let (due, pending): (Vec<Delivery>, Vec<Delivery>) =
                queue.drain(..).partition(|d| d.due(now));
            *queue = pending;
            due
        };

        if !due.is_empty() {
            let outcomes: Vec<Outcome> = stream::iter(due)
                .map(|delivery| self.attempt(delivery))
                .buffer_unordered(self.config.delivery_fan_out)
                .collect()
                .await;

            let mut rescheduled = Vec::new();
            let mut log_entries = Vec::new();
            let mut signals = Vec::new();

            {
                let mut subscriptions = self.subscriptions.write().await;
                let mut dirty = false;
                for outcome in outcomes {
                    match outcome {
                        Outcome::Delivered { delivery } => {
                            if let Some(sub) = subscriptions.get_mut(&delivery.subscription_id) {
                                sub.successes += 1;
                                sub.last_triggered_at = Some(Utc::now());
                                dirty = true;
                            }
                            signals.push(WebhookSignal::Delivered {
                                subscription_id: delivery.subscription_id,
                                event_id: delivery.event.id,
                            });
                        }
                        Outcome::Retry { delivery, reason } => {
                            if let Some(sub) = subscriptions.get_mut(&delivery.subscription_id) {
                                sub.failures += 1;
                                sub.retries += 1;
                                dirty = true;
                            }
                            log_entries.push(LogEntry::new(
                                "delivery_retry",
                                format!(
                                    "event {} to {}: attempt {} failed ({reason}), retry scheduled",
                                    delivery.event.id,
                                    delivery.subscription_id,
                                    delivery.attempt - 1,
                                ),
                            ));
                            rescheduled.push(delivery);
                        }
                        Outcome::Exhausted { delivery, reason } => {
                            if let Some(sub) = subscriptions.get_mut(&delivery.subscription_id) {
                                sub.failures += 1;
                                dirty = true;
                            }
                            log_entries.push(LogEntry::new(
                                "delivery_failed",
                                format!(
                                    "event {} to {} dropped after {} attempts ({reason})",
                                    delivery.event.id, delivery.subscription_id, delivery.attempt,
                                ),
                            ));
                            signals.push(WebhookSignal::DeliveryFailed {
                                subscription_id: delivery.subscription_id,
                                event_id: delivery.event.id,
                            });
                        }
                        Outcome::Orphaned => {}
                    }
                }
                if dirty {
                    if let Err(err) = self.subscriptions_snapshot.save(&*subscriptions) {
                        warn!(error = %err, "subscription counter checkpoint failed");
                    }
                }
            }

            if !rescheduled.is_empty() {
                self.queue.lock().await.extend(rescheduled);
            }

            {
                let mut event_log = self.event_log.lock().await;
                for entry in log_entries {
                    if let Err(err) = event_log.append(entry) {
                        warn!(error = %err, "event log write failed");
                    }
                }
            }

            for signal in signals {
                let _ = self.signals.send(signal);
            }
        }

        self.checkpoint_queue().await;
        let _ = self.signals.send(WebhookSignal::QueueProcessed);
    }

    /// Attempt one delivery; transient failures come back rescheduled
    async fn attempt(&self, mut delivery: Delivery) -> Outcome {
        let subscription = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions.get(&delivery.subscription_id).cloned()
        };
        let Some(subscription) = subscription else {
            debug!(
                subscription_id = %delivery.subscription_id,
                "dropping delivery for unregistered subscription"
            );
            return Outcome::Orphaned;
        };

        let reason = match self.post(&subscription, &delivery.event, &delivery.payload).await {
            Ok(status) if status.is_success() => return Outcome::Delivered { delivery },
            Ok(status) => format!("status {status}"),
            Err(err) => err.to_string(),
        };

        if delivery.attempt >= self.config.max_retries {
            warn!(
                subscription_id = %delivery.subscription_id,
                event_id = %delivery.event.id,
                attempts = delivery.attempt,
                "delivery dropped after max attempts"
            );
            return Outcome::Exhausted { delivery, reason };
        }

        let delay = self.config.retry_delay(delivery.attempt);
        delivery.attempt += 1;
        delivery.next_attempt_at = Some(Utc::now() + delay);
        delivery.status = DeliveryStatus::Retrying;
        Outcome::Retry { delivery, reason }
    }

    /// Sign and POST the canonical payload bytes to the subscription URL
    pub(crate) async fn post(
        &self,
        subscription: &Subscription,
        event: &WebhookEvent,
        payload: &str,
    ) -> Result<reqwest::StatusCode> {
        let signature = signer::sign(&subscription.secret, payload.as_bytes())?;

        let mut request = self
            .client
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-ID", subscription.id.to_string())
            .header("X-Event-ID", event.id.to_string())
            .header("X-Event-Type", event.event_type.as_str())
            .header("X-Timestamp", event.timestamp.to_string())
            .header("X-Signature", signature)
            .body(payload.to_string());
        for (name, value) in &subscription.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentPayError::internal(format!("delivery transport error: {e}")))?;
        Ok(response.status())
    }

    /// Persist the queue as it stands
    pub(crate) async fn checkpoint_queue(&self) {
        let queue = self.queue.lock().await;
        if let Err(err) = self.queue_snapshot.save(&*queue) {
            warn!(error = %err, "queue checkpoint failed");
        }
    }
}
