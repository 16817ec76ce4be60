//! In-memory [`JournalStore`] backed by `BTreeMap`s and broadcast
//! channels. Same schema semantics as the Redis store, no I/O; used by
//! the deterministic engine tests and handy for examples.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use crate::keys;
use crate::store::{JournalStore, Subscription, SUBSCRIBE_CHANNEL_CAP};
use crate::types::{EventRef, PersistentRecord, TagEntry};

#[derive(Default)]
struct Inner {
    // persistence id -> sequence nr -> record
    events: HashMap<String, BTreeMap<u64, PersistentRecord>>,
    // tag -> tag-local index -> reference
    tags: HashMap<String, BTreeMap<u64, EventRef>>,
    ids: BTreeSet<String>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBE_CHANNEL_CAP).0)
            .clone()
    }

    /// Publish a raw payload on a channel. Writes do this themselves;
    /// exposed so tests can inject duplicate or malformed notifications.
    pub fn publish(&self, channel: &str, payload: impl Into<String>) {
        // No receivers is fine; notifications are best-effort nudges.
        let _ = self.sender(channel).send(payload.into());
    }

    /// Store a record and register its identifier and tag entries, then
    /// notify every channel the write touched. Mirrors the write-side
    /// plugin; sequence numbers start at 1, tag indices at 0.
    pub fn append(
        &self,
        persistence_id: &str,
        payload: serde_json::Value,
        tags: &[&str],
    ) -> u64 {
        let mut notifications = Vec::new();
        let sequence_nr;
        {
            let mut inner = self.inner.lock().unwrap();

            let journal = inner.events.entry(persistence_id.to_string()).or_default();
            sequence_nr = journal.last_key_value().map_or(1, |(seq, _)| seq + 1);
            let record = PersistentRecord::new(persistence_id, sequence_nr, payload)
                .with_tags(tags.iter().copied());
            journal.insert(sequence_nr, record);

            if inner.ids.insert(persistence_id.to_string()) {
                notifications.push((keys::ids_channel().to_string(), persistence_id.to_string()));
            }

            for tag in tags {
                let entries = inner.tags.entry(tag.to_string()).or_default();
                let index = entries.last_key_value().map_or(0, |(i, _)| i + 1);
                entries.insert(
                    index,
                    EventRef {
                        sequence_nr,
                        persistence_id: persistence_id.to_string(),
                    },
                );
                notifications.push((keys::tag_channel(tag), index.to_string()));
            }

            notifications.push((
                keys::events_channel(persistence_id),
                sequence_nr.to_string(),
            ));
        }

        for (channel, payload) in notifications {
            self.publish(&channel, payload);
        }
        sequence_nr
    }

    /// Tombstone all records with `sequence_nr <= to_seq`.
    pub fn delete_to(&self, persistence_id: &str, to_seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(journal) = inner.events.get_mut(persistence_id) {
            for (_, record) in journal.range_mut(..=to_seq) {
                record.deleted = true;
            }
        }
    }

    /// Drop a record outright, leaving any tag entries pointing at it in
    /// place. Models a cleaned journal with dangling tag references.
    pub fn remove_record(&self, persistence_id: &str, sequence_nr: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(journal) = inner.events.get_mut(persistence_id) {
            journal.remove(&sequence_nr);
        }
    }
}

#[async_trait]
impl JournalStore for MemoryStore {
    async fn events_range(
        &self,
        persistence_id: &str,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<PersistentRecord>> {
        if lo > hi {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .get(persistence_id)
            .map(|journal| journal.range(lo..=hi).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn tag_range(&self, tag: &str, lo: u64, hi: u64) -> Result<Vec<TagEntry>> {
        if lo > hi {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tags
            .get(tag)
            .map(|entries| {
                entries
                    .range(lo..=hi)
                    .map(|(index, event_ref)| TagEntry {
                        index: *index,
                        event_ref: event_ref.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_record(
        &self,
        persistence_id: &str,
        sequence_nr: u64,
    ) -> Result<Option<PersistentRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .get(persistence_id)
            .and_then(|journal| journal.get(&sequence_nr).cloned()))
    }

    async fn persistence_ids(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.ids.iter().cloned().collect())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBE_CHANNEL_CAP);
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            channel = %channel_name,
                            skipped,
                            "Subscription lagged; coalescing notifications"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }
}
