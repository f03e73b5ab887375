use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

use crate::core::error::{CoreError, CoreResult};

pub const TICKET_CREATED: &str = "tickets.created";
pub const TICKET_UPDATED: &str = "tickets.updated";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub name: String,
    pub context: Value,
}

/// Receives domain events raised by ticket operations.
#[async_trait]
pub trait DomainEventSink: Send + Sync {
    async fn emit(&self, name: &str, context: Value) -> CoreResult<()>;
}

/// Discards everything.
pub struct NullEventSink;

#[async_trait]
impl DomainEventSink for NullEventSink {
    async fn emit(&self, _name: &str, _context: Value) -> CoreResult<()> {
        Ok(())
    }
}

/// Keeps emitted events in memory.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> CoreResult<Vec<DomainEvent>> {
        Ok(self
            .events
            .lock()
            .map_err(|_| CoreError::internal("Event log lock poisoned"))?
            .clone())
    }

    pub fn names(&self) -> CoreResult<Vec<String>> {
        Ok(self.events()?.into_iter().map(|e| e.name).collect())
    }
}

#[async_trait]
impl DomainEventSink for RecordingEventSink {
    async fn emit(&self, name: &str, context: Value) -> CoreResult<()> {
        self.events
            .lock()
            .map_err(|_| CoreError::internal("Event log lock poisoned"))?
            .push(DomainEvent {
                name: name.to_string(),
                context,
            });
        Ok(())
    }
}
