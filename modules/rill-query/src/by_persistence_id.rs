//! Query family over one identifier's journal: pages come straight from
//! the per-identifier sorted set, and the envelope offset is the event's
//! own sequence number.

use futures::future::BoxFuture;

use rill_events::{keys, JournalStore, Subscription};

use crate::source::{Candidate, Fetcher, Page};

pub(crate) struct ByPersistenceId<S: JournalStore> {
    store: S,
    persistence_id: String,
}

impl<S: JournalStore> ByPersistenceId<S> {
    pub(crate) fn new(store: S, persistence_id: impl Into<String>) -> Self {
        Self {
            store,
            persistence_id: persistence_id.into(),
        }
    }
}

impl<S: JournalStore> Fetcher for ByPersistenceId<S> {
    fn fetch(&self, lo: u64, hi: u64) -> BoxFuture<'static, rill_events::Result<Page>> {
        let store = self.store.clone();
        let persistence_id = self.persistence_id.clone();
        Box::pin(async move {
            let records = store.events_range(&persistence_id, lo, hi).await?;
            let last_index = records.last().map(|r| r.sequence_nr);
            let entries = records
                .into_iter()
                .map(|r| Candidate {
                    index: r.sequence_nr,
                    sequence_nr: r.sequence_nr,
                    persistence_id: r.persistence_id,
                    payload: r.payload,
                    deleted: r.deleted,
                })
                .collect();
            Ok(Page {
                entries,
                last_index,
            })
        })
    }

    fn channel(&self) -> String {
        keys::events_channel(&self.persistence_id)
    }

    fn subscribe(&self) -> BoxFuture<'static, rill_events::Result<Subscription>> {
        let store = self.store.clone();
        let channel = self.channel();
        Box::pin(async move { store.subscribe(&channel).await })
    }
}
