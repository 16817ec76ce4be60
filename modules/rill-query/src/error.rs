use thiserror::Error;

use rill_events::StoreError;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store returned something the state machine considers
    /// impossible, e.g. a page whose indices are not ascending.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
