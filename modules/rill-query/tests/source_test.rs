//! State-machine tests against a scripted store: reads resolve exactly
//! when the test says so, which makes the notification/in-flight races
//! deterministic instead of timing-dependent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};

use rill_events::{
    keys, JournalStore, PersistentRecord, Result as StoreResult, StoreError, Subscription,
    TagEntry,
};
use rill_query::{QueryConfig, QueryError, ReadJournal};

const SETTLE: Duration = Duration::from_millis(100);
const COMPLETE: Duration = Duration::from_secs(5);

/// A step of the scripted read plan: either resolve at once, or hold the
/// read open until the test releases it.
enum Step {
    Page(StoreResult<Vec<PersistentRecord>>),
    Gated(oneshot::Receiver<()>, StoreResult<Vec<PersistentRecord>>),
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Step>,
    // ("subscribe" | "fetch") in call order, fetches with their bounds
    ops: Vec<String>,
    fetches: Vec<(u64, u64)>,
    inflight: usize,
    max_inflight: usize,
    channels: HashMap<String, broadcast::Sender<String>>,
}

#[derive(Clone, Default)]
struct ScriptedStore {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedStore {
    fn new() -> Self {
        Self::default()
    }

    fn push_page(&self, records: Vec<PersistentRecord>) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push_back(Step::Page(Ok(records)));
    }

    fn push_failure(&self, err: StoreError) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push_back(Step::Page(Err(err)));
    }

    /// Queue a read that stays in flight until the returned sender fires.
    fn push_gated_page(&self, records: Vec<PersistentRecord>) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.script.push_back(Step::Gated(gate, Ok(records)));
        release
    }

    fn fetch_count(&self) -> usize {
        self.inner.lock().unwrap().fetches.len()
    }

    fn fetches(&self) -> Vec<(u64, u64)> {
        self.inner.lock().unwrap().fetches.clone()
    }

    fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    fn max_inflight(&self) -> usize {
        self.inner.lock().unwrap().max_inflight
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .clone()
    }

    fn publish(&self, channel: &str, payload: &str) {
        let _ = self.sender(channel).send(payload.to_string());
    }
}

#[async_trait]
impl JournalStore for ScriptedStore {
    async fn events_range(
        &self,
        _persistence_id: &str,
        lo: u64,
        hi: u64,
    ) -> StoreResult<Vec<PersistentRecord>> {
        let step = {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.push("fetch".to_string());
            inner.fetches.push((lo, hi));
            inner.inflight += 1;
            inner.max_inflight = inner.max_inflight.max(inner.inflight);
            inner.script.pop_front()
        };
        let result = match step.expect("read past the end of the scripted plan") {
            Step::Page(result) => result,
            Step::Gated(gate, result) => {
                let _ = gate.await;
                result
            }
        };
        self.inner.lock().unwrap().inflight -= 1;
        result
    }

    async fn tag_range(&self, _tag: &str, _lo: u64, _hi: u64) -> StoreResult<Vec<TagEntry>> {
        Ok(Vec::new())
    }

    async fn read_record(
        &self,
        _persistence_id: &str,
        _sequence_nr: u64,
    ) -> StoreResult<Option<PersistentRecord>> {
        Ok(None)
    }

    async fn persistence_ids(&self) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut source = {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.push("subscribe".to_string());
            drop(inner);
            self.sender(channel).subscribe()
        };
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            while let Ok(payload) = source.recv().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }
}

fn record(sequence_nr: u64) -> PersistentRecord {
    PersistentRecord::new("fsm", sequence_nr, json!(format!("e-{sequence_nr}")))
}

fn deleted_record(sequence_nr: u64) -> PersistentRecord {
    let mut r = record(sequence_nr);
    r.deleted = true;
    r
}

fn journal(store: &ScriptedStore, max: usize) -> ReadJournal<ScriptedStore> {
    // RUST_LOG=trace makes the state machine narrate itself.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    ReadJournal::new(store.clone(), QueryConfig::new(max))
}

async fn wait_until(store: &ScriptedStore, cond: impl Fn(&ScriptedStore) -> bool) {
    tokio::time::timeout(COMPLETE, async {
        while !cond(store) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scripted condition not reached in time");
}

// =========================================================================
// Notification / in-flight interaction
// =========================================================================

#[tokio::test]
async fn notification_racing_an_inflight_read_forces_a_requery() {
    let store = ScriptedStore::new();
    // First read held open; the notification lands while it is in flight.
    // Its empty result would normally park the query, but the
    // notification promised more, so a second (empty) read must follow.
    let release = store.push_gated_page(Vec::new());
    store.push_page(Vec::new());

    let mut stream = journal(&store, 10).events_by_persistence_id("fsm", 0, u64::MAX);
    let consumer = tokio::spawn(async move { stream.next().await });

    wait_until(&store, |s| s.fetch_count() == 1).await;
    store.publish(&keys::events_channel("fsm"), "1");
    tokio::time::sleep(SETTLE).await;
    release.send(()).unwrap();

    wait_until(&store, |s| s.fetch_count() == 2).await;
    tokio::time::sleep(SETTLE).await;
    assert!(!consumer.is_finished(), "live stream must stay parked");
    consumer.abort();
}

#[tokio::test]
async fn empty_read_without_notification_parks_without_requery() {
    let store = ScriptedStore::new();
    store.push_page(Vec::new());

    let mut stream = journal(&store, 10).events_by_persistence_id("fsm", 0, u64::MAX);
    let consumer = tokio::spawn(async move { stream.next().await });

    wait_until(&store, |s| s.fetch_count() == 1).await;
    tokio::time::sleep(SETTLE).await;
    assert_eq!(store.fetch_count(), 1, "parked query must not poll the store");
    assert!(!consumer.is_finished());
    consumer.abort();
}

#[tokio::test]
async fn live_query_subscribes_before_the_first_read() {
    let store = ScriptedStore::new();
    store.push_page(Vec::new());

    let mut stream = journal(&store, 10).events_by_persistence_id("fsm", 0, u64::MAX);
    let consumer = tokio::spawn(async move { stream.next().await });

    wait_until(&store, |s| s.fetch_count() == 1).await;
    assert_eq!(store.ops(), vec!["subscribe", "fetch"]);
    consumer.abort();
}

#[tokio::test]
async fn current_query_never_subscribes() {
    let store = ScriptedStore::new();
    store.push_page(vec![record(1)]);
    store.push_page(Vec::new());

    let envelopes: Vec<_> = tokio::time::timeout(
        COMPLETE,
        journal(&store, 10)
            .current_events_by_persistence_id("fsm", 0, u64::MAX)
            .map(|e| e.unwrap())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("current stream did not complete");

    assert_eq!(envelopes.len(), 1);
    assert_eq!(store.ops(), vec!["fetch", "fetch"]);
}

// =========================================================================
// Paging and cursor advancement
// =========================================================================

#[tokio::test]
async fn at_most_one_read_in_flight_across_pages() {
    let store = ScriptedStore::new();
    store.push_page(vec![record(1), record(2)]);
    store.push_page(vec![record(3), record(4)]);
    store.push_page(Vec::new());

    let envelopes: Vec<_> = tokio::time::timeout(
        COMPLETE,
        journal(&store, 2)
            .current_events_by_persistence_id("fsm", 0, u64::MAX)
            .map(|e| e.unwrap())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("current stream did not complete");

    assert_eq!(envelopes.len(), 4);
    assert_eq!(store.max_inflight(), 1);
    // Each page resumes strictly after the last examined sequence nr.
    assert_eq!(store.fetches(), vec![(0, 1), (3, 4), (5, 6)]);
}

#[tokio::test]
async fn fully_filtered_page_advances_the_cursor_and_requeries_at_once() {
    let store = ScriptedStore::new();
    store.push_page(vec![deleted_record(1), deleted_record(2), deleted_record(3)]);
    store.push_page(vec![record(4)]);
    store.push_page(Vec::new());

    let envelopes: Vec<_> = tokio::time::timeout(
        COMPLETE,
        journal(&store, 3)
            .current_events_by_persistence_id("fsm", 0, u64::MAX)
            .map(|e| e.unwrap())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("current stream did not complete");

    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].sequence_nr, 4);
    // The emptied-out page still moved the cursor past sequence nr 3.
    assert_eq!(store.fetches()[1].0, 4);
}

#[tokio::test]
async fn delivering_the_envelope_at_to_completes_without_another_read() {
    let store = ScriptedStore::new();
    store.push_page(vec![record(1), record(2)]);

    let envelopes: Vec<_> = tokio::time::timeout(
        COMPLETE,
        journal(&store, 10)
            .current_events_by_persistence_id("fsm", 0, 2)
            .map(|e| e.unwrap())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("current stream did not complete");

    assert_eq!(envelopes.len(), 2);
    assert_eq!(store.fetch_count(), 1);
}

// =========================================================================
// Failure modes
// =========================================================================

#[tokio::test]
async fn store_failure_fails_the_stream() {
    let store = ScriptedStore::new();
    store.push_failure(StoreError::Command("boom".to_string()));

    let mut stream = journal(&store, 10).current_events_by_persistence_id("fsm", 0, u64::MAX);
    let err = stream.next().await.expect("expected an item").unwrap_err();
    assert!(matches!(err, QueryError::Store(_)));
    assert!(stream.next().await.is_none(), "failed stream must be terminal");
}

#[tokio::test]
async fn entries_below_the_cursor_are_filtered_not_emitted() {
    let store = ScriptedStore::new();
    // The query starts at 5; stale duplicates below the cursor are
    // dropped, and the cursor never rewinds below its starting point.
    store.push_page(vec![record(1), record(2)]);
    store.push_page(Vec::new());

    let envelopes: Vec<_> = tokio::time::timeout(
        COMPLETE,
        journal(&store, 10)
            .current_events_by_persistence_id("fsm", 5, u64::MAX)
            .map(|e| e.unwrap())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("current stream did not complete");

    assert!(envelopes.is_empty());
    assert_eq!(store.fetches()[1].0, 5, "cursor must not rewind");
}

#[tokio::test]
async fn disordered_page_is_a_protocol_error() {
    let store = ScriptedStore::new();
    store.push_page(vec![record(2), record(1)]);

    let mut stream = journal(&store, 10).current_events_by_persistence_id("fsm", 0, u64::MAX);
    let err = stream.next().await.expect("expected an item").unwrap_err();
    assert!(matches!(err, QueryError::Protocol(_)));
    assert!(stream.next().await.is_none());
}
