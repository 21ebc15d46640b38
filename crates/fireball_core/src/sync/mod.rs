//! Remote fetch, bulk import, history cursor and replay.

pub mod conflict;
pub mod cursor;
pub mod ingest;
pub mod remote_source;
pub mod replay;
