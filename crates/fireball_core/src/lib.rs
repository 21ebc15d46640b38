//! Local-store synchronization core for FireballWatch.
//! This crate is the single source of truth for sync invariants.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod sync;

pub use config::{ConfigError, SyncConfig};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::change::{
    ChangeOp, ChangeToken, HistoryTransaction, ObjectRef, FOREGROUND_AUTHOR, IMPORT_AUTHOR,
};
pub use model::fireball::{Fireball, FireballData, FireballId, FireballPatch};
pub use model::group::{FireballGroup, GroupId, GroupPatch};
pub use model::ValidationError;
pub use repo::store::{PersistentStore, StoreAccess, StoreError, StoreSnapshot};
pub use service::controller::{ControllerError, SyncController};
pub use service::query::{FireballQuery, FireballSort};
pub use sync::conflict::MergePolicy;
pub use sync::cursor::{HistoryCursorStore, TokenIoError};
pub use sync::ingest::{BatchIngestor, IngestReport, IngestionError};
pub use sync::remote_source::{
    decode_payload, DecodeError, FetchError, FireballSource, HttpFireballSource, SourceError,
};
pub use sync::replay::{ChangeReplayEngine, ReplayError, ReplayOutcome};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
