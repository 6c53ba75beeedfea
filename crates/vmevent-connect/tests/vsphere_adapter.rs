//! vSphere adapter against an in-memory vCenter

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use vmevent_connect::checkpoint::{Checkpoint, KvStore, MemoryKvStore};
use vmevent_connect::poll::{CycleOutcome, PollingAdapter};
use vmevent_connect::testing::MockSink;
use vmevent_connect::vsphere::xml::Element;
use vmevent_connect::vsphere::{VsphereAdapter, VsphereApi, VsphereConfig, VsphereEvent};
use vmevent_connect::{ConnectorError, ConnectorResult};

const SDK: &str = "https://vc.local/sdk";

#[derive(Default)]
struct Vcenter {
    now: Option<DateTime<Utc>>,
    log: Vec<VsphereEvent>,
    /// Index of the next event the open collector returns
    cursor: Option<usize>,
    collector_begins: Vec<DateTime<Utc>>,
    destroyed: usize,
    logins: usize,
    logouts: usize,
    expire_session: bool,
}

/// Clones share one vCenter so tests can change it while the adapter owns a handle
#[derive(Clone, Default)]
struct MockVcenter(Arc<Mutex<Vcenter>>);

impl MockVcenter {
    fn at(now: DateTime<Utc>) -> Self {
        let vc = Self::default();
        vc.0.lock().now = Some(now);
        vc
    }

    fn set_now(&self, now: DateTime<Utc>) {
        self.0.lock().now = Some(now);
    }

    fn push(&self, key: i32, created: DateTime<Utc>) {
        let xml = format!(
            r#"<returnval xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="VmPoweredOnEvent">
                 <key>{}</key><chainId>{}</chainId><createdTime>{}</createdTime>
                 <userName>VSPHERE.LOCAL\alice</userName>
                 <fullFormattedMessage>vm-{} is powered on</fullFormattedMessage>
               </returnval>"#,
            key,
            key,
            created.to_rfc3339(),
            key
        );
        let event = VsphereEvent::from_element(Element::parse(&xml).unwrap()).unwrap();
        self.0.lock().log.push(event);
    }

    fn expire_session(&self) {
        self.0.lock().expire_session = true;
    }

    fn collector_begins(&self) -> Vec<DateTime<Utc>> {
        self.0.lock().collector_begins.clone()
    }
}

#[async_trait]
impl VsphereApi for MockVcenter {
    async fn login(&mut self) -> ConnectorResult<()> {
        let mut vc = self.0.lock();
        vc.logins += 1;
        vc.expire_session = false;
        vc.cursor = None;
        Ok(())
    }

    async fn current_time(&mut self) -> ConnectorResult<DateTime<Utc>> {
        Ok(self.0.lock().now.unwrap_or_else(Utc::now))
    }

    async fn create_collector(&mut self, begin: DateTime<Utc>) -> ConnectorResult<()> {
        let mut vc = self.0.lock();
        let start = vc
            .log
            .iter()
            .position(|e| e.created_time >= begin)
            .unwrap_or(vc.log.len());
        vc.cursor = Some(start);
        vc.collector_begins.push(begin);
        Ok(())
    }

    async fn read_next_events(&mut self, max_count: u32) -> ConnectorResult<Vec<VsphereEvent>> {
        let mut vc = self.0.lock();
        if vc.expire_session {
            return Err(ConnectorError::SessionExpired(
                "The session is not authenticated.".to_string(),
            ));
        }
        let Some(cursor) = vc.cursor else {
            return Err(ConnectorError::state("no event history collector"));
        };

        let end = (cursor + max_count as usize).min(vc.log.len());
        let batch = vc.log[cursor..end].to_vec();
        vc.cursor = Some(end);
        Ok(batch)
    }

    async fn destroy_collector(&mut self) -> ConnectorResult<()> {
        let mut vc = self.0.lock();
        if vc.cursor.take().is_some() {
            vc.destroyed += 1;
        }
        Ok(())
    }

    async fn logout(&mut self) -> ConnectorResult<()> {
        self.0.lock().logouts += 1;
        Ok(())
    }

    fn source_identity(&self) -> &str {
        SDK
    }

    fn api_version(&self) -> &str {
        "8.0.2.0"
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn config(extra: &str) -> VsphereConfig {
    serde_yaml::from_str(&format!(
        "address: {}\nusername: administrator@vsphere.local\npassword: secret\n{}",
        SDK, extra
    ))
    .unwrap()
}

fn adapter(
    vc: &MockVcenter,
    sink: &MockSink,
    kv: &Arc<MemoryKvStore>,
    extra: &str,
) -> VsphereAdapter<MockVcenter, MockSink> {
    let kv: Arc<dyn KvStore> = kv.clone();
    VsphereAdapter::new("vc-test", vc.clone(), sink.clone(), &config(extra), kv)
}

#[tokio::test]
async fn test_delivers_and_flushes_checkpoint() {
    let vc = MockVcenter::at(t(0));
    let sink = MockSink::new();
    let kv = Arc::new(MemoryKvStore::new());
    let mut adapter = adapter(&vc, &sink, &kv, "");

    adapter.start().await.unwrap();
    assert_eq!(vc.collector_begins(), vec![t(0)]);
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Idle);

    vc.push(101, t(1));
    vc.push(102, t(2));
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["101", "102"]);

    let delivered = sink.delivered();
    assert_eq!(delivered[0].event_type, "com.vmware.vsphere.VmPoweredOnEvent");
    assert_eq!(delivered[0].source, SDK);
    assert_eq!(delivered[0].extensions["eventclass"], "event");
    assert_eq!(delivered[0].extensions["vsphereapiversion"], "8.0.2.0");

    let checkpoint = adapter.current_checkpoint().unwrap();
    assert_eq!(checkpoint.last_event_key, 102);
    assert_eq!(checkpoint.last_event_type, "VmPoweredOnEvent");
    assert_eq!(checkpoint.last_event_timestamp, t(2));
    assert_eq!(checkpoint.source_identity, SDK);

    adapter.checkpoint().await.unwrap();
    adapter.checkpoint().await.unwrap();
    assert_eq!(kv.save_count(), 1);

    let stored = kv.get("vc-test").await.unwrap().unwrap();
    let stored: Checkpoint = serde_json::from_str(&stored).unwrap();
    assert_eq!(stored.last_event_key, 102);
}

#[tokio::test]
async fn test_partial_delivery_rewinds_to_checkpoint() {
    let vc = MockVcenter::at(t(0));
    let sink = MockSink::new().reject_id("3");
    let kv = Arc::new(MemoryKvStore::new());
    let mut adapter = adapter(&vc, &sink, &kv, "");
    adapter.start().await.unwrap();

    for key in 1..=4 {
        vc.push(key, t(key as i64));
    }
    vc.set_now(t(10));

    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["1", "2"]);
    assert_eq!(adapter.current_checkpoint().unwrap().last_event_key, 2);
    assert_eq!(vc.collector_begins(), vec![t(0), t(2)]);
    assert_eq!(vc.0.lock().destroyed, 1);

    sink.accept_all();
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["1", "2", "3", "4"]);
    assert_eq!(sink.attempted_ids(), vec!["1", "2", "3", "3", "4"]);
    assert_eq!(adapter.current_checkpoint().unwrap().last_event_key, 4);
}

#[tokio::test]
async fn test_first_event_rejected_without_checkpoint() {
    let vc = MockVcenter::at(t(0));
    let sink = MockSink::new().reject_id("1");
    let kv = Arc::new(MemoryKvStore::new());
    let mut adapter = adapter(&vc, &sink, &kv, "");
    adapter.start().await.unwrap();

    vc.push(1, t(1));
    vc.push(2, t(2));
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Idle);
    assert!(adapter.current_checkpoint().is_none());
    assert_eq!(vc.collector_begins(), vec![t(0), t(1)]);

    sink.accept_all();
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["1", "2"]);
}

#[tokio::test]
async fn test_expired_session_is_recovered() {
    let vc = MockVcenter::at(t(0));
    let sink = MockSink::new();
    let kv = Arc::new(MemoryKvStore::new());
    let mut adapter = adapter(&vc, &sink, &kv, "");
    adapter.start().await.unwrap();

    vc.push(1, t(1));
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);

    vc.push(2, t(2));
    vc.set_now(t(5));
    vc.expire_session();
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Idle);
    assert_eq!(vc.0.lock().logins, 2);
    assert_eq!(vc.collector_begins(), vec![t(0), t(1)]);

    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["1", "2"]);
}

#[tokio::test]
async fn test_expired_session_without_checkpoint_keeps_begin_time() {
    let vc = MockVcenter::at(t(0));
    let sink = MockSink::new();
    let kv = Arc::new(MemoryKvStore::new());
    let mut adapter = adapter(&vc, &sink, &kv, "");
    adapter.start().await.unwrap();

    for key in 1..=3 {
        vc.push(key, t(key as i64));
    }
    vc.set_now(t(5));
    vc.expire_session();
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Idle);
    assert!(adapter.current_checkpoint().is_none());
    assert_eq!(vc.collector_begins(), vec![t(0), t(0)]);

    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["1", "2", "3"]);
}

#[tokio::test]
async fn test_restart_resumes_within_replay_window() {
    let vc = MockVcenter::at(t(0));
    let sink = MockSink::new();
    let kv = Arc::new(MemoryKvStore::new());

    let mut first = adapter(&vc, &sink, &kv, "checkpoint:\n  maxAge: 5m\n");
    first.start().await.unwrap();
    vc.push(1, t(1));
    vc.push(2, t(2));
    assert_eq!(first.poll().await.unwrap(), CycleOutcome::Progress);
    first.shutdown().await.unwrap();
    assert_eq!(kv.save_count(), 1);
    assert_eq!(vc.0.lock().logouts, 1);

    // Restart within the window: resume at the checkpoint, skip the boundary event
    vc.push(3, t(3));
    vc.set_now(t(60));
    let mut second = adapter(&vc, &sink, &kv, "checkpoint:\n  maxAge: 5m\n");
    second.start().await.unwrap();
    assert_eq!(second.current_checkpoint().unwrap().last_event_key, 2);
    assert_eq!(second.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["1", "2", "3"]);
    second.shutdown().await.unwrap();

    // Restart an hour later: the begin time is clamped to the window
    vc.set_now(t(3600));
    let mut third = adapter(&vc, &sink, &kv, "checkpoint:\n  maxAge: 5m\n");
    third.start().await.unwrap();
    assert_eq!(
        vc.collector_begins().last().copied(),
        Some(t(3600) - ChronoDuration::minutes(5))
    );
    assert_eq!(third.poll().await.unwrap(), CycleOutcome::Idle);
}

#[tokio::test]
async fn test_skip_policy_keeps_reading() {
    let vc = MockVcenter::at(t(0));
    let sink = MockSink::new().reject_id("2");
    let kv = Arc::new(MemoryKvStore::new());
    let mut adapter = adapter(&vc, &sink, &kv, "delivery_policy: skip_and_continue\n");
    adapter.start().await.unwrap();

    for key in 1..=3 {
        vc.push(key, t(key as i64));
    }
    assert_eq!(adapter.poll().await.unwrap(), CycleOutcome::Progress);
    assert_eq!(sink.delivered_ids(), vec!["1", "3"]);
    assert_eq!(adapter.current_checkpoint().unwrap().last_event_key, 3);
    assert_eq!(vc.collector_begins(), vec![t(0)]);
}
