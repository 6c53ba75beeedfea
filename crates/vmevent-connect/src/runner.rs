//! Connector runner - drives one adapter from start to shutdown
//!
//! Features:
//! - Builds the configured adapter and its HTTP sink
//! - Status tracking (`starting`, `running`, `stopped`, `failed`)
//! - Graceful shutdown: vendor sessions are released under a fresh timeout, even
//!   when the run ended by cancellation

use crate::config::{ConnectConfig, ConnectorConfig};
use crate::error::{ConnectError, ConnectorError, ConnectorStatus, Result};
use crate::horizon::HorizonAdapter;
use crate::poll::{PollLoop, PollingAdapter};
use crate::sink::HttpSink;
use crate::vsphere::VsphereAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Upper bound for logout and collector cleanup after the loop exits
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConnectorRunner<A> {
    name: String,
    adapter: A,
    poll_loop: PollLoop,
    cancel: CancellationToken,
    status: Arc<RwLock<ConnectorStatus>>,
}

impl<A: PollingAdapter> ConnectorRunner<A> {
    pub fn new(adapter: A, poll_loop: PollLoop, cancel: CancellationToken) -> Self {
        Self {
            name: adapter.name().to_string(),
            adapter,
            poll_loop,
            cancel,
            status: Arc::new(RwLock::new(ConnectorStatus::Starting)),
        }
    }

    /// Shared view of the connector status
    pub fn status_handle(&self) -> Arc<RwLock<ConnectorStatus>> {
        self.status.clone()
    }

    async fn set_status(&self, status: ConnectorStatus) {
        *self.status.write().await = status;
        info!(connector = %self.name, status = %status, "connector status changed");
    }

    /// Run the adapter until cancellation or a fatal error.
    ///
    /// Cancellation is a clean stop and hands the adapter back.
    pub async fn run(mut self) -> Result<A> {
        self.set_status(ConnectorStatus::Starting).await;

        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectorError::Cancelled("cancelled during start".to_string())),
            result = self.adapter.start() => result,
        };

        let outcome = match started {
            Ok(()) => {
                self.set_status(ConnectorStatus::Running).await;
                self.poll_loop.run(&mut self.adapter).await
            }
            Err(e) => {
                if !e.is_cancelled() {
                    error!(connector = %self.name, error = %e, "connector failed to start");
                }
                Err(e)
            }
        };

        self.shutdown_adapter().await;

        match outcome {
            Ok(()) => {
                self.set_status(ConnectorStatus::Stopped).await;
                Ok(self.adapter)
            }
            Err(e) if e.is_cancelled() => {
                self.set_status(ConnectorStatus::Stopped).await;
                Ok(self.adapter)
            }
            Err(e) => {
                self.set_status(ConnectorStatus::Failed).await;
                Err(ConnectError::source(&self.name, e.to_string()))
            }
        }
    }

    /// Best effort; failures are logged, never returned
    async fn shutdown_adapter(&mut self) {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.adapter.shutdown()).await {
            Ok(Ok(())) => info!(connector = %self.name, "connector shut down"),
            Ok(Err(e)) => warn!(connector = %self.name, error = %e, "connector shutdown failed"),
            Err(_) => warn!(
                connector = %self.name,
                timeout = ?SHUTDOWN_TIMEOUT,
                "connector shutdown timed out"
            ),
        }
    }
}

/// Build the configured connector and run it until `cancel` fires
pub async fn run_connector(config: &ConnectConfig, cancel: CancellationToken) -> Result<()> {
    let sink = HttpSink::new(config.sink.clone())?;
    let poll_loop = PollLoop::new(
        config.connector.poll_interval(),
        config.connector.backoff(),
        cancel.clone(),
    );

    info!(
        connector = %config.name,
        kind = config.connector.kind(),
        endpoint = %config.connector.endpoint(),
        sink = %config.sink.url,
        "starting connector"
    );

    match &config.connector {
        ConnectorConfig::Horizon(horizon) => {
            let adapter = HorizonAdapter::from_config(config.name.as_str(), horizon, sink)?;
            ConnectorRunner::new(adapter, poll_loop, cancel).run().await?;
        }
        ConnectorConfig::Vsphere(vsphere) => {
            let adapter = VsphereAdapter::from_config(config.name.as_str(), vsphere, sink)?;
            ConnectorRunner::new(adapter, poll_loop, cancel).run().await?;
        }
    }
    Ok(())
}
