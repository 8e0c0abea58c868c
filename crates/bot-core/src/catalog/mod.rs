//! Read-only dataset lookups: skill metadata, the race index, and the event
//! catalog. Loaded once and consumed through in-memory indexes.

pub mod events;
pub mod races;
pub mod skills;
