//! The public query surface: six operations over one journal store.

use std::pin::Pin;

use futures::Stream;

use rill_events::{JournalStore, RedisStore};

use crate::by_persistence_id::ByPersistenceId;
use crate::by_tag::ByTag;
use crate::config::QueryConfig;
use crate::error::Result;
use crate::persistence_ids::IdSource;
use crate::source::EventSource;

/// The element type of event queries. `offset` is query-local: the
/// sequence number for by-id queries, the tag index for by-tag queries;
/// strictly increasing within one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub offset: u64,
    pub persistence_id: String,
    pub sequence_nr: u64,
    pub payload: serde_json::Value,
}

/// Starting point of a by-tag query. `Sequence(k)` is inclusive: the
/// envelope at tag index `k` is the first one emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Offset {
    #[default]
    NoOffset,
    Sequence(u64),
}

impl Offset {
    fn starting_index(self) -> u64 {
        match self {
            Offset::NoOffset => 0,
            Offset::Sequence(index) => index,
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;
pub type IdStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Read side of the journal.
///
/// Every operation returns a lazy, demand-driven stream owning its own
/// cursor and, for live variants, its own subscription. Current variants
/// are finite snapshots; live variants follow the journal's notifications
/// and only end on cancellation (drop) or a fatal store error.
#[derive(Clone)]
pub struct ReadJournal<S: JournalStore = RedisStore> {
    store: S,
    config: QueryConfig,
}

impl ReadJournal<RedisStore> {
    /// Connect a journal backed by Redis, e.g. `redis://127.0.0.1/`.
    pub async fn connect(url: &str, config: QueryConfig) -> rill_events::Result<Self> {
        Ok(Self::new(RedisStore::connect(url).await?, config))
    }
}

impl<S: JournalStore> ReadJournal<S> {
    pub fn new(store: S, config: QueryConfig) -> Self {
        Self { store, config }
    }

    /// Events of one identifier with `from <= sequence_nr <= to`, as the
    /// journal stood when the stream exhausted it. Finite.
    pub fn current_events_by_persistence_id(
        &self,
        persistence_id: &str,
        from: u64,
        to: u64,
    ) -> EventStream {
        Box::pin(EventSource::new(
            ByPersistenceId::new(self.store.clone(), persistence_id),
            from,
            to,
            false,
            self.config.max,
        ))
    }

    /// Like [`current_events_by_persistence_id`], but follows the tail:
    /// events persisted while the stream is alive are emitted as the
    /// journal announces them.
    ///
    /// [`current_events_by_persistence_id`]: Self::current_events_by_persistence_id
    pub fn events_by_persistence_id(
        &self,
        persistence_id: &str,
        from: u64,
        to: u64,
    ) -> EventStream {
        Box::pin(EventSource::new(
            ByPersistenceId::new(self.store.clone(), persistence_id),
            from,
            to,
            true,
            self.config.max,
        ))
    }

    /// Events carrying `tag`, in tag-index order from `offset`. Finite.
    pub fn current_events_by_tag(&self, tag: &str, offset: Offset) -> EventStream {
        Box::pin(EventSource::new(
            ByTag::new(self.store.clone(), tag),
            offset.starting_index(),
            u64::MAX,
            false,
            self.config.max,
        ))
    }

    /// Like [`current_events_by_tag`], but follows the tail.
    ///
    /// [`current_events_by_tag`]: Self::current_events_by_tag
    pub fn events_by_tag(&self, tag: &str, offset: Offset) -> EventStream {
        Box::pin(EventSource::new(
            ByTag::new(self.store.clone(), tag),
            offset.starting_index(),
            u64::MAX,
            true,
            self.config.max,
        ))
    }

    /// All identifiers known to the journal, sorted. Finite.
    pub fn current_persistence_ids(&self) -> IdStream {
        Box::pin(IdSource::new(self.store.clone(), false))
    }

    /// All known identifiers, then every newly registered one; each
    /// identifier appears at most once.
    pub fn persistence_ids(&self) -> IdStream {
        Box::pin(IdSource::new(self.store.clone(), true))
    }
}
