//! Delivery targets for normalized events

pub mod http;

pub use http::{HttpSink, HttpSinkConfig};

use crate::error::ConnectorResult;
use crate::event::NormalizedEvent;
use async_trait::async_trait;
use std::sync::Arc;

/// A single configured delivery target.
///
/// `Ok(())` is an ack. `Err` is a nack, returned only after the sink's own transport
/// retries are exhausted or the target refused the event outright. Callers never
/// retry a nacked event themselves; the checkpoint position decides what is fetched
/// again.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, event: &NormalizedEvent) -> ConnectorResult<()>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Arc<S> {
    async fn send(&self, event: &NormalizedEvent) -> ConnectorResult<()> {
        (**self).send(event).await
    }
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Box<S> {
    async fn send(&self, event: &NormalizedEvent) -> ConnectorResult<()> {
        (**self).send(event).await
    }
}
