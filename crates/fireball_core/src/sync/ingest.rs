//! Bulk import of freshly fetched records.
//!
//! # Responsibility
//! - Turn one batch of normalized records into a single import-authored
//!   store transaction.
//!
//! # Invariants
//! - An empty batch is a successful no-op that never touches the store.
//! - A batch is all-or-nothing; nothing is retried here.
//! - Pure append: records get fresh identities, no dedup against existing rows.

use crate::model::change::{ChangeOp, ChangeToken, IMPORT_AUTHOR};
use crate::model::fireball::{Fireball, FireballData};
use crate::model::ValidationError;
use crate::repo::store::{PersistentStore, StoreAccess, StoreError};
use log::{error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

#[derive(Debug)]
pub enum IngestionError {
    /// Record at `index` of the batch is invalid; nothing was written.
    Validation {
        index: usize,
        source: ValidationError,
    },
    /// The bulk write failed and was rolled back.
    Store(StoreError),
}

impl Display for IngestionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { index, source } => {
                write!(f, "import record {index} is invalid: {source}")
            }
            Self::Store(err) => write!(f, "bulk import failed: {err}"),
        }
    }
}

impl Error for IngestionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation { source, .. } => Some(source),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<StoreError> for IngestionError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    /// History position of the import, `None` for an empty batch.
    pub token: Option<ChangeToken>,
}

#[derive(Debug, Clone)]
pub struct BatchIngestor {
    store: PersistentStore,
    author: String,
}

impl BatchIngestor {
    pub fn new(store: PersistentStore) -> Self {
        Self::with_author(store, IMPORT_AUTHOR)
    }

    pub fn with_author(store: PersistentStore, author: impl Into<String>) -> Self {
        Self {
            store,
            author: author.into(),
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// Writes `records` as one transaction on a connection of its own.
    pub fn ingest(&self, records: Vec<FireballData>) -> Result<IngestReport, IngestionError> {
        if records.is_empty() {
            return Ok(IngestReport::default());
        }
        for (index, record) in records.iter().enumerate() {
            record
                .validate()
                .map_err(|source| IngestionError::Validation { index, source })?;
        }

        let started_at = Instant::now();
        let ops: Vec<ChangeOp> = records
            .into_iter()
            .map(|data| ChangeOp::InsertFireball {
                fireball: Fireball::new(data),
            })
            .collect();

        let result = self
            .store
            .connect()
            .and_then(|mut conn| conn.save(&self.author, &ops));
        match result {
            Ok(token) => {
                info!(
                    "event=bulk_ingest module=sync status=ok inserted={} duration_ms={}",
                    ops.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(IngestReport {
                    inserted: ops.len(),
                    token,
                })
            }
            Err(err) => {
                error!(
                    "event=bulk_ingest module=sync status=error records={} duration_ms={} error={}",
                    ops.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchIngestor, IngestionError};
    use crate::model::change::IMPORT_AUTHOR;
    use crate::model::fireball::FireballData;
    use crate::repo::store::{PersistentStore, StoreAccess};
    use chrono::{TimeZone, Utc};

    fn record(latitude: f64) -> FireballData {
        FireballData {
            timestamp: Utc.with_ymd_and_hms(2022, 3, 4, 5, 6, 7).unwrap(),
            latitude,
            longitude: 12.0,
            altitude: 20.0,
            velocity: 14.0,
            radiated_energy: 3.0,
            impact_energy: 0.2,
        }
    }

    #[test]
    fn batch_lands_as_one_import_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join("fireballs.sqlite")).unwrap();
        let report = BatchIngestor::new(store.clone())
            .ingest(vec![record(1.0), record(2.0), record(3.0)])
            .unwrap();
        assert_eq!(report.inserted, 3);

        let conn = store.connect().unwrap();
        let history = conn.history_after(None, "nobody").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, IMPORT_AUTHOR);
        assert_eq!(history[0].changes.len(), 3);
        assert_eq!(Some(history[0].token), report.token);
        assert_eq!(conn.load_snapshot().unwrap().fireballs.len(), 3);
    }

    #[test]
    fn invalid_record_rejects_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join("fireballs.sqlite")).unwrap();
        let err = BatchIngestor::new(store.clone())
            .ingest(vec![record(1.0), record(123.0)])
            .unwrap_err();
        assert!(matches!(err, IngestionError::Validation { index: 1, .. }));
        assert!(store.connect().unwrap().load_snapshot().unwrap().fireballs.is_empty());
    }
}
