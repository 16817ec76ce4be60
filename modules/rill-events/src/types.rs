//! Core types of the journal store. Domain-agnostic.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A journal entry as written by the persistence side and stored as one
/// JSON document per sorted-set member, scored by `sequence_nr`.
///
/// The read side consumes it opaquely except for the fields below;
/// `payload` is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentRecord {
    pub persistence_id: String,
    pub sequence_nr: u64,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl PersistentRecord {
    pub fn new(
        persistence_id: impl Into<String>,
        sequence_nr: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_nr,
            payload,
            deleted: false,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Decode a sorted-set member into a record. Any parse failure is fatal
    /// to the query that issued the read.
    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw)
            .map_err(|e| StoreError::Decode(format!("invalid record JSON: {e}")))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("record serialization is infallible")
    }
}

/// A member of a per-tag sorted set: `"<sequenceNr>:<persistenceId>"`.
/// The sequence number is ASCII decimal; the identifier is everything
/// after the first colon (identifiers may themselves contain colons).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRef {
    pub sequence_nr: u64,
    pub persistence_id: String,
}

impl FromStr for EventRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, id) = s
            .split_once(':')
            .ok_or_else(|| StoreError::Decode(format!("event reference without colon: {s:?}")))?;
        let sequence_nr = seq
            .parse::<u64>()
            .map_err(|_| StoreError::Decode(format!("non-numeric sequence nr in reference: {s:?}")))?;
        if id.is_empty() {
            return Err(StoreError::Decode(format!(
                "event reference without persistence id: {s:?}"
            )));
        }
        Ok(Self {
            sequence_nr,
            persistence_id: id.to_string(),
        })
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence_nr, self.persistence_id)
    }
}

/// An event reference together with its tag-local index (the score of the
/// member in the per-tag sorted set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub index: u64,
    pub event_ref: EventRef,
}
