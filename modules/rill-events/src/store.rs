//! Store gateway — paged reads and pub/sub subscriptions over the
//! journal's Redis schema.
//!
//! The read side never writes. Everything here is a thin, typed wrapper
//! over sorted-set range reads, point reads, and channel subscriptions;
//! decoding stored members into [`PersistentRecord`]s and [`EventRef`]s
//! happens at this boundary so the query engine above only sees typed
//! values or a fatal [`StoreError`].

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use futures::StreamExt;

use crate::error::Result;
use crate::keys;
use crate::types::{EventRef, PersistentRecord, TagEntry};

/// Capacity of the per-subscription funnel channel. Notifications are
/// nudges, not deliveries; a full funnel only delays coalesced re-reads.
pub(crate) const SUBSCRIBE_CHANNEL_CAP: usize = 128;

// ---------------------------------------------------------------------------
// JournalStore
// ---------------------------------------------------------------------------

/// Read-side view of the journal store.
///
/// Implementations must be cheap to clone; the query engine clones the
/// store into each page-fetch future.
#[async_trait]
pub trait JournalStore: Clone + Send + Sync + Unpin + 'static {
    /// Records of one identifier with `lo <= sequence_nr <= hi`, ascending.
    async fn events_range(
        &self,
        persistence_id: &str,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<PersistentRecord>>;

    /// Event references of one tag with `lo <= index <= hi`, ascending,
    /// each paired with its tag-local index.
    async fn tag_range(&self, tag: &str, lo: u64, hi: u64) -> Result<Vec<TagEntry>>;

    /// Point read of a single record, used by the by-tag secondary fetch.
    async fn read_record(
        &self,
        persistence_id: &str,
        sequence_nr: u64,
    ) -> Result<Option<PersistentRecord>>;

    /// Snapshot of all known persistence identifiers.
    async fn persistence_ids(&self) -> Result<Vec<String>>;

    /// Open a pub/sub subscription on `channel`. Raw payloads are funneled
    /// into the returned [`Subscription`]; delivery stops when it is dropped.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to an open pub/sub subscription.
///
/// Messages arrive on an owned mpsc receiver so a consumer can poll them
/// from a single place; the forwarder task (and with it the underlying
/// pub/sub connection) is stopped when the handle is dropped.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Build a subscription from a payload receiver and the forwarder task
    /// feeding it. The task is aborted when the subscription is dropped.
    pub fn new(rx: mpsc::Receiver<String>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Poll for the next raw payload. `Ready(None)` means the subscription
    /// was lost and no further messages will arrive.
    pub fn poll_message(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }

    /// Await the next raw payload.
    pub async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Parse a sequence-number or tag-index notification payload.
///
/// Malformed payloads are logged and dropped; the journal re-publishes on
/// every write, so the next notification or the next pull makes progress.
pub fn parse_notification(channel: &str, payload: &str) -> Option<u64> {
    match payload.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                channel = %channel,
                payload = %payload,
                "Ignoring malformed journal notification"
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// RedisStore
// ---------------------------------------------------------------------------

/// Journal store backed by Redis sorted sets and pub/sub.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Connect to the journal's Redis instance, e.g. `redis://127.0.0.1/`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }
}

/// Sorted-set score argument. `u64::MAX` marks an unbounded upper end and
/// must not round-trip through a double, so it becomes `+inf`.
fn score(value: u64) -> String {
    if value == u64::MAX {
        "+inf".to_string()
    } else {
        value.to_string()
    }
}

#[async_trait]
impl JournalStore for RedisStore {
    async fn events_range(
        &self,
        persistence_id: &str,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<PersistentRecord>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .zrangebyscore(keys::events_key(persistence_id), score(lo), score(hi))
            .await?;
        raw.iter().map(|m| PersistentRecord::decode(m)).collect()
    }

    async fn tag_range(&self, tag: &str, lo: u64, hi: u64) -> Result<Vec<TagEntry>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, u64)> = conn
            .zrangebyscore_withscores(keys::tag_key(tag), score(lo), score(hi))
            .await?;
        raw.iter()
            .map(|(member, index)| {
                Ok(TagEntry {
                    index: *index,
                    event_ref: member.parse::<EventRef>()?,
                })
            })
            .collect()
    }

    async fn read_record(
        &self,
        persistence_id: &str,
        sequence_nr: u64,
    ) -> Result<Option<PersistentRecord>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .zrangebyscore(
                keys::events_key(persistence_id),
                score(sequence_nr),
                score(sequence_nr),
            )
            .await?;
        raw.first().map(|m| PersistentRecord::decode(m)).transpose()
    }

    async fn persistence_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(keys::ids_key()).await?;
        Ok(ids)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_CHANNEL_CAP);
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(
                            channel = %channel_name,
                            error = %e,
                            "Dropping unreadable pub/sub payload"
                        );
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Receiver gone: the query was cancelled.
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }
}

// ---------------------------------------------------------------------------
// Write-side fixtures
// ---------------------------------------------------------------------------

/// Test fixtures mirroring the write-side plugin's schema: one record per
/// sequence nr, tag entries indexed densely from 0, and a notification on
/// every channel a write touches. Only for preloading test journals.
#[cfg(feature = "test-utils")]
impl RedisStore {
    pub async fn append(
        &self,
        persistence_id: &str,
        payload: serde_json::Value,
        tags: &[&str],
    ) -> Result<u64> {
        let mut conn = self.conn.clone();
        let key = keys::events_key(persistence_id);

        let last: Vec<(String, u64)> = conn.zrevrange_withscores(&key, 0, 0).await?;
        let sequence_nr = last.first().map_or(1, |(_, s)| s + 1);

        let record = PersistentRecord::new(persistence_id, sequence_nr, payload)
            .with_tags(tags.iter().copied());
        let _: () = conn.zadd(&key, record.encode(), sequence_nr).await?;

        let newly_added: i64 = conn.sadd(keys::ids_key(), persistence_id).await?;
        if newly_added > 0 {
            let _: () = conn.publish(keys::ids_channel(), persistence_id).await?;
        }

        for tag in tags {
            let tag_key = keys::tag_key(tag);
            let index: u64 = conn.zcard(&tag_key).await?;
            let entry = EventRef {
                sequence_nr,
                persistence_id: persistence_id.to_string(),
            };
            let _: () = conn.zadd(&tag_key, entry.to_string(), index).await?;
            let _: () = conn
                .publish(keys::tag_channel(tag), index.to_string())
                .await?;
        }

        let _: () = conn
            .publish(keys::events_channel(persistence_id), sequence_nr.to_string())
            .await?;
        Ok(sequence_nr)
    }

    /// Tombstone all records with `sequence_nr <= to_seq`. Scores and tag
    /// entries stay in place; only the `deleted` flag changes.
    pub async fn delete_to(&self, persistence_id: &str, to_seq: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = keys::events_key(persistence_id);

        let raw: Vec<String> = conn.zrangebyscore(&key, score(0), score(to_seq)).await?;
        for member in raw {
            let mut record = PersistentRecord::decode(&member)?;
            if record.deleted {
                continue;
            }
            record.deleted = true;
            let _: () = conn.zrem(&key, &member).await?;
            let _: () = conn.zadd(&key, record.encode(), record.sequence_nr).await?;
        }
        Ok(())
    }
}
