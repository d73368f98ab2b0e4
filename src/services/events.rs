//! Per-event-type business handlers.
//!
//! Handlers are pure with respect to the pipeline: they perform domain
//! side effects and carry no deduplication responsibility.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::Message;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event type this handler is keyed by.
    fn event_type(&self) -> &str;

    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Dispatch table keyed by `event_type`.
///
/// An unknown event type is a logged no-op success, not an error.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OrderCreatedHandler));
        registry.register(Arc::new(PaymentReceivedHandler));
        registry.register(Arc::new(InventoryUpdateHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .insert(handler.event_type().to_string(), handler);
    }

    pub async fn dispatch(&self, message: &Message) -> anyhow::Result<()> {
        match self.handlers.get(&message.event_type) {
            Some(handler) => handler.handle(message).await,
            None => {
                warn!(
                    event_type = %message.event_type,
                    message_id = %message.message_id,
                    "Unknown event type, skipping"
                );
                Ok(())
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct OrderCreatedHandler;

#[async_trait]
impl EventHandler for OrderCreatedHandler {
    fn event_type(&self) -> &str {
        "ORDER_CREATED"
    }

    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        info!(message_id = %message.message_id, "Processing ORDER_CREATED: {}", message.payload);
        Ok(())
    }
}

pub struct PaymentReceivedHandler;

#[async_trait]
impl EventHandler for PaymentReceivedHandler {
    fn event_type(&self) -> &str {
        "PAYMENT_RECEIVED"
    }

    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        info!(message_id = %message.message_id, "Processing PAYMENT_RECEIVED: {}", message.payload);
        Ok(())
    }
}

pub struct InventoryUpdateHandler;

#[async_trait]
impl EventHandler for InventoryUpdateHandler {
    fn event_type(&self) -> &str {
        "INVENTORY_UPDATE"
    }

    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        info!(message_id = %message.message_id, "Processing INVENTORY_UPDATE: {}", message.payload);
        Ok(())
    }
}
