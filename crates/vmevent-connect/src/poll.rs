//! Per-connector control loop
//!
//! One loop drives one adapter: poll, then wait either the poll interval (after
//! progress) or the next backoff delay (after an idle or failed cycle). While waiting
//! the loop also serves the adapter's checkpoint timer. Cancellation is observed
//! before every poll and during every wait.

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Result of a single poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// At least one event was delivered
    Progress,
    /// Nothing new, or nothing could be delivered
    Idle,
    /// The source cannot serve events right now; wait the longest backoff
    Stalled,
}

/// A vendor event source driven by [`PollLoop`]
#[async_trait]
pub trait PollingAdapter: Send {
    fn name(&self) -> &str;

    /// Authenticate and position the stream. Failures here are fatal.
    async fn start(&mut self) -> ConnectorResult<()>;

    async fn poll(&mut self) -> ConnectorResult<CycleOutcome>;

    /// Interval of the checkpoint timer, `None` when the adapter keeps no checkpoint
    fn checkpoint_period(&self) -> Option<Duration> {
        None
    }

    async fn checkpoint(&mut self) -> ConnectorResult<()> {
        Ok(())
    }

    /// Release vendor resources; called once after the loop has exited
    async fn shutdown(&mut self) -> ConnectorResult<()>;
}

pub struct PollLoop {
    poll_interval: Duration,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl PollLoop {
    pub fn new(poll_interval: Duration, backoff: BackoffConfig, cancel: CancellationToken) -> Self {
        Self {
            poll_interval,
            backoff: Backoff::new(backoff),
            cancel,
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run until cancelled or until the adapter hits a fatal error.
    ///
    /// Returns `Err(ConnectorError::Cancelled)` on cancellation. The first poll
    /// happens immediately.
    pub async fn run<A>(&mut self, adapter: &mut A) -> ConnectorResult<()>
    where
        A: PollingAdapter + ?Sized,
    {
        let period = adapter.checkpoint_period();
        let flush_every_cycle = period.is_some_and(|p| p.is_zero());
        let mut checkpoint_timer = period.filter(|p| !p.is_zero()).map(|p| {
            let mut timer = tokio::time::interval_at(Instant::now() + p, p);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            if self.cancel.is_cancelled() {
                return Err(ConnectorError::Cancelled(format!(
                    "connector '{}' cancelled",
                    adapter.name()
                )));
            }

            let delay = match adapter.poll().await {
                Ok(CycleOutcome::Progress) => {
                    self.backoff.reset();
                    self.poll_interval
                }
                Ok(CycleOutcome::Idle) => self.backoff.next_delay(),
                Ok(CycleOutcome::Stalled) => {
                    self.backoff.saturate();
                    self.backoff.next_delay()
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_fatal() => {
                    error!(connector = %adapter.name(), error = %e, "poll failed permanently");
                    return Err(e);
                }
                Err(ConnectorError::BackingStoreUninitialized) => {
                    error!(
                        connector = %adapter.name(),
                        "event database is not configured on the server, backing off"
                    );
                    self.backoff.saturate();
                    self.backoff.next_delay()
                }
                Err(e) => {
                    warn!(connector = %adapter.name(), error = %e, "poll failed");
                    self.backoff.next_delay()
                }
            };

            if flush_every_cycle {
                run_checkpoint(adapter).await;
            }

            debug!(connector = %adapter.name(), delay = ?delay, "waiting for next poll");
            self.wait(adapter, delay, &mut checkpoint_timer).await?;
        }
    }

    async fn wait<A>(
        &self,
        adapter: &mut A,
        delay: Duration,
        checkpoint_timer: &mut Option<Interval>,
    ) -> ConnectorResult<()>
    where
        A: PollingAdapter + ?Sized,
    {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(ConnectorError::Cancelled(format!(
                        "connector '{}' cancelled",
                        adapter.name()
                    )));
                }
                _ = next_tick(checkpoint_timer) => run_checkpoint(adapter).await,
                _ = &mut sleep => return Ok(()),
            }
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_checkpoint<A>(adapter: &mut A)
where
    A: PollingAdapter + ?Sized,
{
    if let Err(e) = adapter.checkpoint().await {
        warn!(connector = %adapter.name(), error = %e, "checkpoint flush failed");
    }
}
