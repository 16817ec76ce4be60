//! Key and channel derivation for the journal's Redis schema.

/// Per-identifier sorted set: score = sequence nr, member = record JSON.
pub fn events_key(persistence_id: &str) -> String {
    format!("journal:events:{persistence_id}")
}

/// Per-tag sorted set: score = tag-local index, member = `"<seq>:<id>"`.
pub fn tag_key(tag: &str) -> String {
    format!("journal:tags:{tag}")
}

/// Set of all known persistence identifiers.
pub fn ids_key() -> &'static str {
    "journal:ids"
}

/// Channel notified with the latest sequence nr written for an identifier.
pub fn events_channel(persistence_id: &str) -> String {
    format!("journal:channel:events:{persistence_id}")
}

/// Channel notified with the latest tag-local index written for a tag.
pub fn tag_channel(tag: &str) -> String {
    format!("journal:channel:tags:{tag}")
}

/// Channel notified with each newly registered persistence identifier.
pub fn ids_channel() -> &'static str {
    "journal:channel:ids"
}
