//! Explicit sync context: store, queues, replay and import wiring.
//!
//! # Responsibility
//! - Build every component from one `SyncConfig` and own their lifetimes.
//! - Expose the collaborator interface: queries, group CRUD, deletes and
//!   fetch triggers.
//!
//! # Invariants
//! - Reads and edits run on the foreground queue; network fetch and bulk
//!   import never do.
//! - Every collaborator write is saved as one foreground-authored transaction.
//! - Fetch, import and replay failures are logged here and never surface
//!   to fire-and-forget callers.

use crate::config::{ConfigError, SyncConfig};
use crate::model::change::ObjectRef;
use crate::model::fireball::{Fireball, FireballId, FireballPatch};
use crate::model::group::{FireballGroup, GroupId, GroupPatch};
use crate::model::ValidationError;
use crate::repo::store::{PersistentStore, StoreAccess, StoreError};
use crate::service::foreground::{ContextClosed, ForegroundContext};
use crate::service::query::FireballQuery;
use crate::service::view_context::ViewContext;
use crate::sync::cursor::HistoryCursorStore;
use crate::sync::ingest::{BatchIngestor, IngestReport, IngestionError};
use crate::sync::remote_source::{FetchError, FireballSource, HttpFireballSource, SourceError};
use crate::sync::replay::{spawn_replay_worker, ChangeReplayEngine, ReplayWorker};
use crossbeam::channel::{bounded, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug)]
pub enum ControllerError {
    Config(ConfigError),
    Validation(ValidationError),
    Store(StoreError),
    Source(SourceError),
    Ingestion(IngestionError),
    Spawn(io::Error),
    Closed,
}

impl Display for ControllerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Source(err) => write!(f, "{err}"),
            Self::Ingestion(err) => write!(f, "{err}"),
            Self::Spawn(err) => write!(f, "worker thread spawn failed: {err}"),
            Self::Closed => write!(f, "sync controller is closed"),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Source(err) => Some(err),
            Self::Ingestion(err) => Some(err),
            Self::Spawn(err) => Some(err),
            Self::Closed => None,
        }
    }
}

impl From<ConfigError> for ControllerError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<ValidationError> for ControllerError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StoreError> for ControllerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<SourceError> for ControllerError {
    fn from(value: SourceError) -> Self {
        Self::Source(value)
    }
}

impl From<IngestionError> for ControllerError {
    fn from(value: IngestionError) -> Self {
        Self::Ingestion(value)
    }
}

impl From<ContextClosed> for ControllerError {
    fn from(_: ContextClosed) -> Self {
        Self::Closed
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Fetches from `source` and imports the result in one transaction.
fn fetch_and_ingest(
    source: &dyn FireballSource,
    ingestor: &BatchIngestor,
) -> ControllerResult<IngestReport> {
    let records = source.fetch()?;
    Ok(ingestor.ingest(records)?)
}

enum BackgroundJob {
    FetchAndIngest,
    Shutdown,
}

struct BackgroundWorker {
    tx: Sender<BackgroundJob>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    fn spawn(source: Arc<dyn FireballSource>, ingestor: BatchIngestor) -> io::Result<Self> {
        // One queued fetch is enough: a second request would fetch the same feed.
        let (tx, rx) = bounded::<BackgroundJob>(1);
        let thread = thread::Builder::new()
            .name("fireball-import".to_string())
            .spawn(move || {
                for job in rx {
                    match job {
                        BackgroundJob::FetchAndIngest => {
                            let started_at = Instant::now();
                            match fetch_and_ingest(source.as_ref(), &ingestor) {
                                Ok(report) => info!(
                                    "event=fetch_cycle module=service status=ok inserted={} duration_ms={}",
                                    report.inserted,
                                    started_at.elapsed().as_millis()
                                ),
                                Err(err) => error!(
                                    "event=fetch_cycle module=service status=error duration_ms={} error={}",
                                    started_at.elapsed().as_millis(),
                                    err
                                ),
                            }
                        }
                        BackgroundJob::Shutdown => break,
                    }
                }
            })?;
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    fn request_fetch(&self) {
        match self.tx.try_send(BackgroundJob::FetchAndIngest) {
            Ok(()) => debug!("event=fetch_request module=service status=queued"),
            Err(TrySendError::Full(_)) => {
                debug!("event=fetch_request module=service status=coalesced")
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("event=fetch_request module=service status=closed")
            }
        }
    }

    fn stop(&mut self) {
        let _ = self.tx.send(BackgroundJob::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event=import_worker module=service status=panicked");
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Process-wide sync context handed to every caller that needs the store.
pub struct SyncController {
    config: SyncConfig,
    store: PersistentStore,
    source: Arc<dyn FireballSource>,
    ingestor: BatchIngestor,
    replay: Option<ReplayWorker>,
    foreground: Option<ForegroundContext>,
    background: Option<BackgroundWorker>,
}

impl SyncController {
    /// Opens the store and starts all workers, fetching from the configured
    /// HTTP endpoint.
    pub fn open(config: SyncConfig) -> ControllerResult<Self> {
        config.validate()?;
        let source = HttpFireballSource::new(config.endpoint.clone(), config.http_timeout())
            .map_err(|err: FetchError| ControllerError::Source(err.into()))?;
        Self::open_with_source(config, Arc::new(source))
    }

    /// Same as `open`, with a caller-provided record source. Rejects a
    /// config that fails `SyncConfig::validate`.
    pub fn open_with_source(
        config: SyncConfig,
        source: Arc<dyn FireballSource>,
    ) -> ControllerResult<Self> {
        config.validate()?;
        let started_at = Instant::now();
        let store = PersistentStore::open(&config.store_path)?;

        // Subscribe before the snapshot so no commit falls between the two.
        let notifications = store.subscribe();

        let view_conn = store.connect()?;
        let view = ViewContext::from_snapshot(view_conn.load_snapshot()?, config.merge_policy);
        let foreground = ForegroundContext::spawn(
            view,
            Box::new(view_conn),
            config.foreground_author.clone(),
        )
        .map_err(ControllerError::Spawn)?;

        let cursor = HistoryCursorStore::new(&config.app_support_dir, &config.cursor_namespace);
        let engine = ChangeReplayEngine::new(store.connect()?, foreground.handle(), cursor)
            .excluding_author(config.foreground_author.clone());
        let replay =
            spawn_replay_worker(engine, notifications).map_err(ControllerError::Spawn)?;

        let ingestor = BatchIngestor::with_author(store.clone(), config.import_author.clone());
        let background = BackgroundWorker::spawn(Arc::clone(&source), ingestor.clone())
            .map_err(ControllerError::Spawn)?;

        info!(
            "event=sync_open module=service status=ok store_id={} duration_ms={}",
            store.store_id(),
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            config,
            store,
            source,
            ingestor,
            replay: Some(replay),
            foreground: Some(foreground),
            background: Some(background),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    /// Queues a fetch-and-import cycle on the background worker and returns
    /// immediately.
    pub fn fetch_fireballs(&self) {
        if let Some(background) = &self.background {
            background.request_fetch();
        }
    }

    /// Runs one fetch-and-import cycle on the calling thread.
    pub fn fetch_and_ingest_now(&self) -> ControllerResult<IngestReport> {
        fetch_and_ingest(self.source.as_ref(), &self.ingestor)
    }

    pub fn fireballs(&self, query: &FireballQuery) -> ControllerResult<Vec<Fireball>> {
        let query = query.clone();
        Ok(self
            .foreground()?
            .perform_and_wait(move |state| state.view.fireballs(&query))?)
    }

    pub fn fireball(&self, id: FireballId) -> ControllerResult<Option<Fireball>> {
        Ok(self
            .foreground()?
            .perform_and_wait(move |state| state.view.fireball(id))?)
    }

    /// Groups sorted by name.
    pub fn groups(&self) -> ControllerResult<Vec<FireballGroup>> {
        Ok(self
            .foreground()?
            .perform_and_wait(|state| state.view.groups())?)
    }

    pub fn group_members(&self, group: GroupId) -> ControllerResult<Vec<Fireball>> {
        self.fireballs(&FireballQuery::in_group(group))
    }

    pub fn fireball_count(&self) -> ControllerResult<usize> {
        Ok(self
            .foreground()?
            .perform_and_wait(|state| state.view.fireball_count())?)
    }

    pub fn add_group(&self, name: &str) -> ControllerResult<GroupId> {
        let group = FireballGroup::new(name)?;
        self.foreground()?
            .perform_and_wait(move |state| -> ControllerResult<GroupId> {
                let id = state.view.insert_group(group)?;
                state.save()?;
                Ok(id)
            })?
    }

    /// Renames a group. Returns `false` when the group is not visible.
    pub fn rename_group(&self, id: GroupId, name: &str) -> ControllerResult<bool> {
        let patch = GroupPatch {
            name: Some(name.to_string()),
        };
        self.foreground()?
            .perform_and_wait(move |state| -> ControllerResult<bool> {
                if !state.view.edit_group(id, patch)? {
                    return Ok(false);
                }
                state.save()?;
                Ok(true)
            })?
    }

    /// Deletes every visible object in `objects`; returns how many were
    /// deleted.
    pub fn delete(&self, objects: &[ObjectRef]) -> ControllerResult<usize> {
        if objects.is_empty() {
            return Ok(0);
        }
        let objects = objects.to_vec();
        self.foreground()?
            .perform_and_wait(move |state| -> ControllerResult<usize> {
                let deleted = objects
                    .into_iter()
                    .filter(|object| state.view.delete(*object))
                    .count();
                state.save()?;
                Ok(deleted)
            })?
    }

    /// Replaces a record's group membership. Returns `false` when the record
    /// is not visible.
    pub fn set_fireball_groups(
        &self,
        id: FireballId,
        groups: BTreeSet<GroupId>,
    ) -> ControllerResult<bool> {
        self.foreground()?
            .perform_and_wait(move |state| -> ControllerResult<bool> {
                if !state.view.edit_fireball(id, FireballPatch::groups(groups)) {
                    return Ok(false);
                }
                state.save()?;
                Ok(true)
            })?
    }

    /// Signals that another process mutated the store file.
    pub fn process_remote_change(&self) {
        self.store.post_remote_change();
    }

    /// Stops the import worker, then replay, then the foreground queue.
    pub fn shutdown(mut self) {
        self.stop();
        info!("event=sync_shutdown module=service status=ok");
    }

    fn foreground(&self) -> ControllerResult<&ForegroundContext> {
        self.foreground.as_ref().ok_or(ControllerError::Closed)
    }

    fn stop(&mut self) {
        if let Some(mut background) = self.background.take() {
            background.stop();
        }
        if let Some(replay) = self.replay.take() {
            replay.shutdown();
        }
        if let Some(foreground) = self.foreground.take() {
            foreground.shutdown();
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop();
    }
}
