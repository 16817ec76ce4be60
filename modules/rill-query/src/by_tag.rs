//! Query family over one tag: pages come from the per-tag sorted set of
//! event references, each resolved to its record by a point read against
//! the owning identifier's journal. The envelope offset is the tag-local
//! index (the reference's score), not the event's sequence number.

use futures::future::BoxFuture;

use rill_events::{keys, JournalStore, Subscription};

use crate::source::{Candidate, Fetcher, Page};

pub(crate) struct ByTag<S: JournalStore> {
    store: S,
    tag: String,
}

impl<S: JournalStore> ByTag<S> {
    pub(crate) fn new(store: S, tag: impl Into<String>) -> Self {
        Self {
            store,
            tag: tag.into(),
        }
    }
}

impl<S: JournalStore> Fetcher for ByTag<S> {
    fn fetch(&self, lo: u64, hi: u64) -> BoxFuture<'static, rill_events::Result<Page>> {
        let store = self.store.clone();
        let tag = self.tag.clone();
        Box::pin(async move {
            let refs = store.tag_range(&tag, lo, hi).await?;
            let last_index = refs.last().map(|entry| entry.index);

            // Secondary reads are issued one by one as each reference is
            // consumed; this keeps envelopes in tag-index order.
            let mut entries = Vec::with_capacity(refs.len());
            for entry in refs {
                let event_ref = entry.event_ref;
                match store
                    .read_record(&event_ref.persistence_id, event_ref.sequence_nr)
                    .await?
                {
                    Some(record) => entries.push(Candidate {
                        index: entry.index,
                        sequence_nr: event_ref.sequence_nr,
                        persistence_id: event_ref.persistence_id,
                        payload: record.payload,
                        deleted: record.deleted,
                    }),
                    None => {
                        // A cleaned journal can leave dangling references
                        // under the tag index. The cursor still advances
                        // past them via `last_index`.
                        tracing::warn!(
                            tag = %tag,
                            reference = %event_ref,
                            index = entry.index,
                            "Tag entry references a missing record; skipping"
                        );
                    }
                }
            }
            Ok(Page {
                entries,
                last_index,
            })
        })
    }

    fn channel(&self) -> String {
        keys::tag_channel(&self.tag)
    }

    fn subscribe(&self) -> BoxFuture<'static, rill_events::Result<Subscription>> {
        let store = self.store.clone();
        let channel = self.channel();
        Box::pin(async move { store.subscribe(&channel).await })
    }
}
