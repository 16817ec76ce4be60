//! Store gateway for a Redis-backed event journal.
//!
//! Wraps the journal's Redis schema (per-identifier sorted sets, per-tag
//! sorted sets of event references, an identifier set, and notification
//! channels) behind the [`JournalStore`] trait. Zero knowledge of the
//! query engine built on top.
//!
//! Consumers get typed records; decode failures surface as fatal
//! [`StoreError`]s at this boundary.

pub mod error;
pub mod keys;
pub mod memory;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use store::{parse_notification, JournalStore, RedisStore, Subscription};
pub use types::{EventRef, PersistentRecord, TagEntry};
