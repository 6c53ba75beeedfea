//! Batch delivery policies
//!
//! Two strategies, picked per connector kind:
//!
//! - [`skip_and_continue`] (Horizon default): every event is tried; failures are
//!   logged and skipped. The returned marker is the last delivered event, which may
//!   sit *after* a failed one. Advancing past that marker drops the failed event for
//!   good. This is the accepted poison-pill trade-off of the Horizon adapter.
//! - [`stop_at_first_failure`] (vSphere default): delivery stops at the first sink
//!   rejection, so the marker only ever covers a contiguous delivered prefix and the
//!   next poll re-fetches from the failure point (at-least-once).
//!
//! Conversion failures are per-event under both policies: they are logged and the
//! event is skipped, since retrying a deterministic conversion can never succeed.
//! Neither policy returns a batch-level error.

use crate::event::{EventConverter, NormalizedEvent};
use crate::sink::Sink;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    SkipAndContinue,
    StopAtFirstFailure,
}

/// What happened to an ordered batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Events acked by the sink
    pub delivered: usize,
    /// Events that failed conversion or were nacked
    pub failed: usize,
    /// Index of the last acked event
    pub last_delivered: Option<usize>,
    /// Index of the rejection that stopped delivery (stop-at-first-failure only)
    pub stopped_at: Option<usize>,
}

impl DeliveryReport {
    pub fn made_progress(&self) -> bool {
        self.last_delivered.is_some()
    }
}

impl DeliveryPolicy {
    pub async fn deliver<R, C, S>(self, events: &[R], converter: &C, sink: &S) -> DeliveryReport
    where
        R: Sync,
        C: EventConverter<R> + ?Sized,
        S: Sink + ?Sized,
    {
        match self {
            Self::SkipAndContinue => skip_and_continue(events, converter, sink).await,
            Self::StopAtFirstFailure => stop_at_first_failure(events, converter, sink).await,
        }
    }
}

fn convert_or_log<R, C>(converter: &C, raw: &R, index: usize) -> Option<NormalizedEvent>
where
    C: EventConverter<R> + ?Sized,
{
    match converter.convert(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(index, error = %e, "skipping event that failed conversion");
            None
        }
    }
}

pub async fn skip_and_continue<R, C, S>(events: &[R], converter: &C, sink: &S) -> DeliveryReport
where
    R: Sync,
    C: EventConverter<R> + ?Sized,
    S: Sink + ?Sized,
{
    let mut report = DeliveryReport::default();

    for (index, raw) in events.iter().enumerate() {
        let Some(event) = convert_or_log(converter, raw, index) else {
            report.failed += 1;
            continue;
        };

        match sink.send(&event).await {
            Ok(()) => {
                report.delivered += 1;
                report.last_delivered = Some(index);
            }
            Err(e) => {
                warn!(id = %event.id, error = %e, "event not delivered, continuing with batch");
                report.failed += 1;
            }
        }
    }

    report
}

pub async fn stop_at_first_failure<R, C, S>(
    events: &[R],
    converter: &C,
    sink: &S,
) -> DeliveryReport
where
    R: Sync,
    C: EventConverter<R> + ?Sized,
    S: Sink + ?Sized,
{
    let mut report = DeliveryReport::default();

    for (index, raw) in events.iter().enumerate() {
        let Some(event) = convert_or_log(converter, raw, index) else {
            report.failed += 1;
            continue;
        };

        if let Err(e) = sink.send(&event).await {
            warn!(
                id = %event.id,
                error = %e,
                remaining = events.len() - index,
                "event not delivered, stopping batch"
            );
            report.failed += 1;
            report.stopped_at = Some(index);
            break;
        }

        report.delivered += 1;
        report.last_delivered = Some(index);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectorError, ConnectorResult};
    use crate::testing::MockSink;
    use chrono::Utc;

    struct IdConverter {
        broken: Option<u32>,
    }

    impl EventConverter<u32> for IdConverter {
        fn convert(&self, raw: &u32) -> ConnectorResult<NormalizedEvent> {
            if self.broken == Some(*raw) {
                return Err(ConnectorError::conversion("broken"));
            }
            Ok(NormalizedEvent::new(raw.to_string(), "test", "test.type", Utc::now()))
        }
    }

    #[tokio::test]
    async fn test_stop_at_first_failure_on_rejection() {
        let sink = MockSink::new().reject_id("2");
        let converter = IdConverter { broken: None };

        let report = stop_at_first_failure(&[1, 2, 3], &converter, &sink).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.last_delivered, Some(0));
        assert_eq!(report.stopped_at, Some(1));
        assert_eq!(sink.attempted_ids(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_stop_at_first_failure_skips_conversion_errors() {
        let sink = MockSink::new();
        let converter = IdConverter { broken: Some(2) };

        let report = stop_at_first_failure(&[1, 2, 3], &converter, &sink).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.last_delivered, Some(2));
        assert_eq!(report.stopped_at, None);
    }

    #[tokio::test]
    async fn test_skip_and_continue_on_conversion_error() {
        let sink = MockSink::new();
        let converter = IdConverter { broken: Some(2) };

        let report = skip_and_continue(&[1, 2, 3], &converter, &sink).await;

        assert_eq!(sink.delivered_ids(), vec!["1", "3"]);
        assert_eq!(report.last_delivered, Some(2));
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_skip_and_continue_marker_passes_rejected_event() {
        let sink = MockSink::new().reject_id("2");
        let converter = IdConverter { broken: None };

        let report = skip_and_continue(&[1, 2, 3], &converter, &sink).await;

        assert_eq!(sink.attempted_ids(), vec!["1", "2", "3"]);
        assert_eq!(report.last_delivered, Some(2));
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn test_nothing_delivered() {
        let sink = MockSink::new();
        sink.reject_all();
        let converter = IdConverter { broken: None };

        for policy in [DeliveryPolicy::SkipAndContinue, DeliveryPolicy::StopAtFirstFailure] {
            let report = policy.deliver(&[1, 2], &converter, &sink).await;
            assert!(!report.made_progress());
        }
    }

    #[test]
    fn test_policy_names() {
        let policy: DeliveryPolicy = serde_yaml::from_str("stop_at_first_failure").unwrap();
        assert_eq!(policy, DeliveryPolicy::StopAtFirstFailure);
    }
}
