//! AgentPay Webhooks - durable event delivery to registered endpoints
//!
//! The delivery engine owns the subscription registry, the durable delivery
//! queue, the retry scheduler, payload signing, and the event log. Emitting
//! is synchronous only up to the enqueue-and-checkpoint step; delivery runs
//! on a cooperative worker tick with bounded fan-out and survives process
//! restarts by rehydrating the queue snapshot.
//!
//! # At-least-once
//!
//! A POST whose 2xx response is lost will be retried, so receivers must
//! deduplicate on `X-Event-ID`. Events for one escrow enqueue in transition
//! order, but no ordering is guaranteed across subscriptions or entities
//! once retries reorder the queue.

pub mod config;
pub mod delivery;
pub mod signal;
pub mod signer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use agentpay_store::{EventLog, JsonSnapshot, LogEntry};
use agentpay_types::{
    AgentPayError, Delivery, DeliveryStatus, EventId, EventPublisher, EventType, Result,
    Subscription, SubscriptionId, SubscriptionInfo, WebhookEvent,
};

pub use config::WebhookConfig;
pub use signal::WebhookSignal;

/// Snapshot file names under the engine's data directory
const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const QUEUE_FILE: &str = "delivery-queue.json";
const EVENT_LOG_FILE: &str = "event-log.json";

/// Signal channel depth; slow observers miss old signals rather than block
const SIGNAL_CAPACITY: usize = 256;

/// Options accepted at registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterOptions {
    /// Custom headers sent with every delivery to this endpoint
    pub headers: HashMap<String, String>,
}

/// Registration response; the only place the secret is ever returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredSubscription {
    pub id: SubscriptionId,
    pub url: String,
    pub events: Vec<EventType>,
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a subscription; only present fields change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSubscription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// Inline result of a synchronous subscription test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTestReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) struct EngineInner {
    pub(crate) config: WebhookConfig,
    pub(crate) subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    pub(crate) queue: Mutex<Vec<Delivery>>,
    pub(crate) subscriptions_snapshot: JsonSnapshot,
    pub(crate) queue_snapshot: JsonSnapshot,
    pub(crate) event_log: Mutex<EventLog>,
    pub(crate) client: reqwest::Client,
    pub(crate) signals: broadcast::Sender<WebhookSignal>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// The webhook delivery engine
#[derive(Clone)]
pub struct WebhookEngine {
    inner: Arc<EngineInner>,
}

impl WebhookEngine {
    /// Open the engine, rehydrating subscriptions, queue, and event log
    /// from `dir`; in-flight deliveries survive restarts this way
    pub fn load(dir: impl AsRef<Path>, config: WebhookConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref();

        let subscriptions_snapshot = JsonSnapshot::in_dir(dir, SUBSCRIPTIONS_FILE);
        let queue_snapshot = JsonSnapshot::in_dir(dir, QUEUE_FILE);
        let subscriptions: HashMap<SubscriptionId, Subscription> =
            subscriptions_snapshot.load()?.unwrap_or_default();
        let queue: Vec<Delivery> = queue_snapshot.load()?.unwrap_or_default();
        let event_log = EventLog::open(dir.join(EVENT_LOG_FILE), config.max_log_entries)?;

        if !queue.is_empty() {
            info!(pending = queue.len(), "delivery queue rehydrated");
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| AgentPayError::internal(format!("HTTP client setup failed: {e}")))?;

        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                subscriptions: RwLock::new(subscriptions),
                queue: Mutex::new(queue),
                subscriptions_snapshot,
                queue_snapshot,
                event_log: Mutex::new(event_log),
                client,
                signals,
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
                stop_tx: Mutex::new(None),
            }),
        })
    }

    /// Start the delivery worker and the periodic checkpointer; a no-op
    /// when already running
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        *self.inner.stop_tx.lock().await = Some(stop_tx);
        let handle = delivery::spawn_worker(self.inner.clone(), stop_rx);
        *self.inner.worker.lock().await = Some(handle);
        info!(
            tick_ms = self.inner.config.worker_tick_ms,
            fan_out = self.inner.config.delivery_fan_out,
            "delivery worker started"
        );
    }

    /// Whether the delivery worker is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop the ticks, await the in-flight batch, and take a final
    /// checkpoint of queue and registry
    pub async fn shutdown(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            if let Some(stop_tx) = self.inner.stop_tx.lock().await.take() {
                let _ = stop_tx.send(());
            }
            if let Some(handle) = self.inner.worker.lock().await.take() {
                let _ = handle.await;
            }
        }

        self.inner.checkpoint_queue().await;
        {
            let subscriptions = self.inner.subscriptions.read().await;
            if let Err(err) = self.inner.subscriptions_snapshot.save(&*subscriptions) {
                warn!(error = %err, "final subscription checkpoint failed");
            }
        }
        let _ = self.inner.signals.send(WebhookSignal::ShuttingDown);
        info!("webhook engine shut down");
    }

    /// Observe delivery signals
    pub fn subscribe(&self) -> broadcast::Receiver<WebhookSignal> {
        self.inner.signals.subscribe()
    }

    // ------------------------------------------------------------------
    // subscription registry
    // ------------------------------------------------------------------

    /// Register an endpoint for a set of event-type tags
    ///
    /// Unrecognized tags are filtered out; an empty filter after the
    /// intersection is rejected. The returned secret is never re-emitted.
    pub async fn register(
        &self,
        url: &str,
        event_types: &[String],
        options: RegisterOptions,
    ) -> Result<RegisteredSubscription> {
        let url = validate_url(url)?;
        let events = filter_event_types(event_types)?;

        let mut secret_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret_bytes);

        let subscription = Subscription {
            id: SubscriptionId::new(),
            url,
            events,
            secret: hex::encode(secret_bytes),
            enabled: true,
            headers: options.headers,
            successes: 0,
            failures: 0,
            retries: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
        };

        let registered = RegisteredSubscription {
            id: subscription.id.clone(),
            url: subscription.url.clone(),
            events: subscription.events.clone(),
            secret: subscription.secret.clone(),
            created_at: subscription.created_at,
        };

        {
            let mut subscriptions = self.inner.subscriptions.write().await;
            subscriptions.insert(subscription.id.clone(), subscription);
            self.inner.subscriptions_snapshot.save(&*subscriptions)?;
        }
        self.log(
            "subscription_registered",
            format!("subscription {} registered for {}", registered.id, registered.url),
        )
        .await;

        info!(subscription_id = %registered.id, url = %registered.url, "subscription registered");
        Ok(registered)
    }

    /// Update an existing subscription; only present fields change
    pub async fn update(
        &self,
        id: &SubscriptionId,
        update: UpdateSubscription,
    ) -> Result<SubscriptionInfo> {
        let url = update.url.as_deref().map(validate_url).transpose()?;
        let events = update
            .event_types
            .as_deref()
            .map(filter_event_types)
            .transpose()?;

        let mut subscriptions = self.inner.subscriptions.write().await;
        let subscription =
            subscriptions
                .get_mut(id)
                .ok_or_else(|| AgentPayError::SubscriptionNotFound {
                    subscription_id: id.to_string(),
                })?;

        if let Some(url) = url {
            subscription.url = url;
        }
        if let Some(events) = events {
            subscription.events = events;
        }
        if let Some(enabled) = update.enabled {
            subscription.enabled = enabled;
        }
        if let Some(headers) = update.headers {
            subscription.headers = headers;
        }

        let info = SubscriptionInfo::from(&*subscription);
        self.inner.subscriptions_snapshot.save(&*subscriptions)?;
        Ok(info)
    }

    /// Remove a subscription; queued deliveries for it are dropped at their
    /// next attempt
    pub async fn unregister(&self, id: &SubscriptionId) -> Result<()> {
        {
            let mut subscriptions = self.inner.subscriptions.write().await;
            if subscriptions.remove(id).is_none() {
                return Err(AgentPayError::SubscriptionNotFound {
                    subscription_id: id.to_string(),
                });
            }
            self.inner.subscriptions_snapshot.save(&*subscriptions)?;
        }
        self.log(
            "subscription_unregistered",
            format!("subscription {id} unregistered"),
        )
        .await;
        info!(subscription_id = %id, "subscription unregistered");
        Ok(())
    }

    /// Get one subscription, secret redacted
    pub async fn get(&self, id: &SubscriptionId) -> Result<SubscriptionInfo> {
        self.inner
            .subscriptions
            .read()
            .await
            .get(id)
            .map(SubscriptionInfo::from)
            .ok_or_else(|| AgentPayError::SubscriptionNotFound {
                subscription_id: id.to_string(),
            })
    }

    /// All subscriptions, secrets redacted
    pub async fn list(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .subscriptions
            .read()
            .await
            .values()
            .map(SubscriptionInfo::from)
            .collect()
    }

    // ------------------------------------------------------------------
    // emission
    // ------------------------------------------------------------------

    /// Emit an event: enqueue one delivery per matching enabled
    /// subscription, checkpoint the queue, log, and return; delivery is
    /// asynchronous
    pub async fn emit_event(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        context: serde_json::Value,
    ) -> Result<EventId> {
        if !EventType::RECOGNIZED.contains(&event_type) {
            return Err(AgentPayError::InvalidEventType {
                event_type: event_type.as_str().to_string(),
            });
        }

        let event = WebhookEvent::new(event_type, data, context);
        let payload = serde_json::to_string(&event)
            .map_err(|e| AgentPayError::internal(format!("event serialization failed: {e}")))?;

        let matching: Vec<SubscriptionId> = self
            .inner
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.matches(event_type))
            .map(|s| s.id.clone())
            .collect();

        if !matching.is_empty() {
            let mut queue = self.inner.queue.lock().await;
            for subscription_id in &matching {
                queue.push(Delivery {
                    subscription_id: subscription_id.clone(),
                    event: event.clone(),
                    payload: payload.clone(),
                    attempt: 1,
                    next_attempt_at: None,
                    status: DeliveryStatus::Pending,
                });
            }
            // every queue addition checkpoints immediately
            self.inner.queue_snapshot.save(&*queue)?;
        }

        self.log(
            event_type.as_str(),
            format!("event {} enqueued for {} subscription(s)", event.id, matching.len()),
        )
        .await;

        Ok(event.id)
    }

    /// Verify a candidate signature for a subscription over the canonical
    /// event bytes, in constant time
    pub async fn verify_signature(
        &self,
        id: &SubscriptionId,
        payload: &str,
        candidate: &str,
    ) -> Result<bool> {
        let secret = {
            let subscriptions = self.inner.subscriptions.read().await;
            subscriptions
                .get(id)
                .map(|s| s.secret.clone())
                .ok_or_else(|| AgentPayError::SubscriptionNotFound {
                    subscription_id: id.to_string(),
                })?
        };
        signer::verify(&secret, payload.as_bytes(), candidate)
    }

    /// Deliver a synthetic event of the reserved `test` type once,
    /// synchronously, bypassing the queue
    pub async fn test_webhook(&self, id: &SubscriptionId) -> Result<WebhookTestReport> {
        let subscription = {
            let subscriptions = self.inner.subscriptions.read().await;
            subscriptions
                .get(id)
                .cloned()
                .ok_or_else(|| AgentPayError::SubscriptionNotFound {
                    subscription_id: id.to_string(),
                })?
        };

        let event = WebhookEvent::new(
            EventType::Test,
            serde_json::json!({ "subscriptionId": id.to_string() }),
            serde_json::json!({ "source": "test" }),
        );
        let payload = serde_json::to_string(&event)
            .map_err(|e| AgentPayError::internal(format!("event serialization failed: {e}")))?;

        match self.inner.post(&subscription, &event, &payload).await {
            Ok(status) if status.is_success() => Ok(WebhookTestReport {
                success: true,
                status: Some(status.as_u16()),
                error: None,
            }),
            Ok(status) => Ok(WebhookTestReport {
                success: false,
                status: Some(status.as_u16()),
                error: Some(format!("endpoint answered {status}")),
            }),
            Err(err) => Ok(WebhookTestReport {
                success: false,
                status: None,
                error: Some(err.to_string()),
            }),
        }
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    /// Deliveries currently queued (pending and scheduled retries)
    pub async fn pending_deliveries(&self) -> Vec<Delivery> {
        self.inner.queue.lock().await.clone()
    }

    /// Queue length
    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// The most recent `n` event log entries, oldest first
    pub async fn recent_log(&self, n: usize) -> Vec<LogEntry> {
        self.inner.event_log.lock().await.recent(n)
    }

    async fn log(&self, kind: &str, detail: String) {
        let mut event_log = self.inner.event_log.lock().await;
        if let Err(err) = event_log.append(LogEntry::new(kind, detail)) {
            warn!(error = %err, "event log write failed");
        }
    }
}

#[async_trait]
impl EventPublisher for WebhookEngine {
    async fn emit(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        context: serde_json::Value,
    ) -> Result<EventId> {
        self.emit_event(event_type, data, context).await
    }
}

/// Parse and normalize a target URL; only http and https are deliverable
fn validate_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| AgentPayError::invalid_input("url", format!("{url} does not parse: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AgentPayError::invalid_input(
            "url",
            format!("scheme {} is not deliverable", parsed.scheme()),
        ));
    }
    Ok(parsed.to_string())
}

/// Intersect requested tags with the closed recognized set, preserving
/// request order and dropping duplicates
fn filter_event_types(requested: &[String]) -> Result<Vec<EventType>> {
    let mut events = Vec::new();
    for tag in requested {
        if let Ok(event_type) = tag.parse::<EventType>() {
            if !events.contains(&event_type) {
                events.push(event_type);
            }
        }
    }
    if events.is_empty() {
        return Err(AgentPayError::NoValidEventTypes);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (WebhookEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookEngine::load(dir.path(), WebhookConfig::default()).unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn test_register_filters_and_rejects_empty() {
        let (engine, _dir) = engine();

        let registered = engine
            .register(
                "https://example.com/hook",
                &["escrow_released".into(), "bogus_tag".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(registered.events, vec![EventType::EscrowReleased]);
        assert_eq!(registered.secret.len(), 64);

        let err = engine
            .register(
                "https://example.com/hook",
                &["bogus_tag".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NO_VALID_EVENT_TYPES");
    }

    #[tokio::test]
    async fn test_register_rejects_bad_urls() {
        let (engine, _dir) = engine();
        let events = vec!["escrow_created".to_string()];
        assert!(engine
            .register("not a url", &events, RegisterOptions::default())
            .await
            .is_err());
        assert!(engine
            .register("ftp://example.com/hook", &events, RegisterOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_redacts_secret() {
        let (engine, _dir) = engine();
        let registered = engine
            .register(
                "https://example.com/hook",
                &["escrow_created".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        let listed = engine.list().await;
        assert_eq!(listed.len(), 1);
        let as_json = serde_json::to_string(&listed).unwrap();
        assert!(!as_json.contains(&registered.secret));
    }

    #[tokio::test]
    async fn test_emit_rejects_reserved_test_type() {
        let (engine, _dir) = engine();
        let err = engine
            .emit_event(EventType::Test, serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_EVENT_TYPE");
    }

    #[tokio::test]
    async fn test_emit_enqueues_per_matching_subscription() {
        let (engine, _dir) = engine();
        engine
            .register(
                "https://example.com/a",
                &["escrow_created".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();
        engine
            .register(
                "https://example.com/b",
                &["escrow_created".into(), "escrow_funded".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();
        engine
            .register(
                "https://example.com/c",
                &["escrow_funded".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        engine
            .emit_event(
                EventType::EscrowCreated,
                serde_json::json!({"escrowId": "e1"}),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert_eq!(engine.queue_len().await, 2);

        // all queued deliveries carry the same event id and payload bytes
        let deliveries = engine.pending_deliveries().await;
        assert_eq!(deliveries[0].event.id, deliveries[1].event.id);
        assert_eq!(deliveries[0].payload, deliveries[1].payload);
    }

    #[tokio::test]
    async fn test_unregister_roundtrip_leaves_collection_unchanged() {
        let (engine, _dir) = engine();
        let before = engine.list().await.len();
        let registered = engine
            .register(
                "https://example.com/hook",
                &["escrow_created".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();
        engine.unregister(&registered.id).await.unwrap();
        assert_eq!(engine.list().await.len(), before);
        assert!(engine.get(&registered.id).await.is_err());
    }

    #[tokio::test]
    async fn test_update_disables_delivery_matching() {
        let (engine, _dir) = engine();
        let registered = engine
            .register(
                "https://example.com/hook",
                &["escrow_created".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();
        engine
            .update(
                &registered.id,
                UpdateSubscription {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        engine
            .emit_event(EventType::EscrowCreated, serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(engine.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_verify_signature_against_registration_secret() {
        let (engine, _dir) = engine();
        let registered = engine
            .register(
                "https://example.com/hook",
                &["escrow_created".into()],
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        let payload = r#"{"hello":"world"}"#;
        let signature = signer::sign(&registered.secret, payload.as_bytes()).unwrap();
        assert!(engine
            .verify_signature(&registered.id, payload, &signature)
            .await
            .unwrap());
        assert!(!engine
            .verify_signature(&registered.id, payload, "deadbeef")
            .await
            .unwrap());
    }
}
