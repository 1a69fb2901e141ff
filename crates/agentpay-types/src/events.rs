//! Event publication seam between the engines
//!
//! The escrow and tipping engines publish transitions through this trait;
//! the webhook engine is the production implementation. Engines publish
//! after their snapshot commits and outside their collection lock, so a
//! publisher is free to take its own locks.

use crate::{EventId, EventType, Result, WebhookEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sink for domain events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Emit an event; returns the fresh event id
    async fn emit(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        context: serde_json::Value,
    ) -> Result<EventId>;
}

/// Publisher that drops every event; the default for engines wired without
/// webhooks
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
    async fn emit(
        &self,
        _event_type: EventType,
        _data: serde_json::Value,
        _context: serde_json::Value,
    ) -> Result<EventId> {
        Ok(EventId::new())
    }
}

/// Publisher that records events in memory, for tests and monitors
#[derive(Default)]
pub struct MemoryPublisher {
    events: Arc<Mutex<Vec<WebhookEvent>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far, in emit order
    pub async fn events(&self) -> Vec<WebhookEvent> {
        self.events.lock().await.clone()
    }

    /// Event types emitted so far, in emit order
    pub async fn event_types(&self) -> Vec<EventType> {
        self.events.lock().await.iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn emit(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        context: serde_json::Value,
    ) -> Result<EventId> {
        let event = WebhookEvent::new(event_type, data, context);
        let id = event.id.clone();
        self.events.lock().await.push(event);
        Ok(id)
    }
}
