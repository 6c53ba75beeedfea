//! Test doubles
//!
//! ```rust,ignore
//! let sink = MockSink::new().reject_id("2");
//! adapter_with(sink.clone()).run().await;
//! assert_eq!(sink.delivered_ids(), vec!["1", "3"]);
//! ```

use crate::error::{ConnectorError, ConnectorResult};
use crate::event::NormalizedEvent;
use crate::sink::Sink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// In-memory sink; clones share the same recording
#[derive(Debug, Clone, Default)]
pub struct MockSink {
    delivered: Arc<Mutex<Vec<NormalizedEvent>>>,
    attempts: Arc<Mutex<Vec<String>>>,
    rejected_ids: Arc<Mutex<HashSet<String>>>,
    reject_all: Arc<Mutex<bool>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nack every event with this id
    pub fn reject_id(self, id: impl Into<String>) -> Self {
        self.rejected_ids.lock().insert(id.into());
        self
    }

    /// Nack everything until [`MockSink::accept_all`]
    pub fn reject_all(&self) {
        *self.reject_all.lock() = true;
    }

    pub fn accept_all(&self) {
        *self.reject_all.lock() = false;
        self.rejected_ids.lock().clear();
    }

    pub fn delivered(&self) -> Vec<NormalizedEvent> {
        self.delivered.lock().clone()
    }

    pub fn delivered_ids(&self) -> Vec<String> {
        self.delivered.lock().iter().map(|e| e.id.clone()).collect()
    }

    /// Ids of every send call, acked or not
    pub fn attempted_ids(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Sink for MockSink {
    async fn send(&self, event: &NormalizedEvent) -> ConnectorResult<()> {
        self.attempts.lock().push(event.id.clone());

        if *self.reject_all.lock() || self.rejected_ids.lock().contains(&event.id) {
            return Err(ConnectorError::Rejected(format!("mock rejected {}", event.id)));
        }

        self.delivered.lock().push(event.clone());
        Ok(())
    }
}
