//! Transactional fireball store with change history.
//!
//! # Responsibility
//! - Own the narrow store-access contract (`load`, `save`, history query)
//!   used by the view, the bulk importer and history replay.
//! - Append exactly one history transaction per successful save.
//! - Notify subscribers after every commit.
//!
//! # Invariants
//! - A save with no operations opens no transaction and emits nothing.
//! - A save is all-or-nothing: rows and history commit or roll back together.
//! - Every execution context uses its own `StoreConnection`.

use super::history;
use super::notify::{StoreChange, StoreNotifier};
use super::records;
use crate::db::{open_db, DbError};
use crate::model::change::{ChangeOp, ChangeToken, HistoryTransaction};
use crate::model::fireball::Fireball;
use crate::model::group::FireballGroup;
use crate::model::ValidationError;
use chrono::Utc;
use crossbeam::channel::Receiver;
use log::{debug, error, info};
use rusqlite::{Connection, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    Validation(ValidationError),
    Serialization(serde_json::Error),
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "change payload encoding failed: {err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted store data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ValidationError> for StoreError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Consistent read of the whole store.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub fireballs: Vec<Fireball>,
    pub groups: Vec<FireballGroup>,
    /// Newest history position included in this snapshot.
    pub head: Option<ChangeToken>,
}

/// Store-access contract shared by every execution context.
pub trait StoreAccess: Send {
    fn store_id(&self) -> Uuid;
    fn load_snapshot(&self) -> StoreResult<StoreSnapshot>;
    /// Commits `ops` as one transaction tagged with `author`.
    ///
    /// Returns the new history token, or `None` when `ops` is empty.
    fn save(&mut self, author: &str, ops: &[ChangeOp]) -> StoreResult<Option<ChangeToken>>;
    /// Transactions committed after `after` whose author is not
    /// `excluding_author`, oldest first.
    fn history_after(
        &self,
        after: Option<ChangeToken>,
        excluding_author: &str,
    ) -> StoreResult<Vec<HistoryTransaction>>;
}

/// Shareable handle to one on-disk store.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    store_id: Uuid,
    notifier: StoreNotifier,
}

impl PersistentStore {
    /// Opens (creating and migrating if needed) the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_db(&path)?;
        let store_id = history::ensure_store_id(&conn)?;
        info!(
            "event=store_open module=repo status=ok store_id={} path={}",
            store_id,
            path.display()
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                store_id,
                notifier: StoreNotifier::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn store_id(&self) -> Uuid {
        self.inner.store_id
    }

    /// Opens a new connection for one execution context.
    pub fn connect(&self) -> StoreResult<StoreConnection> {
        let conn = open_db(&self.inner.path)?;
        Ok(StoreConnection {
            conn,
            store: self.clone(),
        })
    }

    /// Subscribes to mutation notifications.
    pub fn subscribe(&self) -> Receiver<StoreChange> {
        self.inner.notifier.subscribe()
    }

    /// Signals a mutation made outside this process (another writer on the
    /// same file).
    pub fn post_remote_change(&self) {
        self.inner.notifier.notify(StoreChange { token: None });
    }
}

/// One execution context's connection to the store.
pub struct StoreConnection {
    conn: Connection,
    store: PersistentStore,
}

impl StoreConnection {
    /// Raw connection, for diagnostics and tests.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StoreAccess for StoreConnection {
    fn store_id(&self) -> Uuid {
        self.store.store_id()
    }

    fn load_snapshot(&self) -> StoreResult<StoreSnapshot> {
        let tx = self.conn.unchecked_transaction()?;
        let snapshot = StoreSnapshot {
            fireballs: records::load_fireballs(&tx)?,
            groups: records::load_groups(&tx)?,
            head: history::head_token(&tx, self.store.store_id())?,
        };
        tx.commit()?;
        Ok(snapshot)
    }

    fn save(&mut self, author: &str, ops: &[ChangeOp]) -> StoreResult<Option<ChangeToken>> {
        if ops.is_empty() {
            return Ok(None);
        }
        for op in ops {
            validate_op(op)?;
        }

        let started_at = Instant::now();
        let token = match commit_ops(&mut self.conn, self.store.store_id(), author, ops) {
            Ok(token) => token,
            Err(err) => {
                error!(
                    "event=store_save module=repo status=error author={:?} ops={} duration_ms={} error={}",
                    author,
                    ops.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err);
            }
        };
        debug!(
            "event=store_save module=repo status=ok author={:?} ops={} sequence={} duration_ms={}",
            author,
            ops.len(),
            token.sequence(),
            started_at.elapsed().as_millis()
        );

        self.store.inner.notifier.notify(StoreChange { token: Some(token) });
        Ok(Some(token))
    }

    fn history_after(
        &self,
        after: Option<ChangeToken>,
        excluding_author: &str,
    ) -> StoreResult<Vec<HistoryTransaction>> {
        history::transactions_after(&self.conn, self.store.store_id(), after, excluding_author)
    }
}

fn commit_ops(
    conn: &mut Connection,
    store_id: Uuid,
    author: &str,
    ops: &[ChangeOp],
) -> StoreResult<ChangeToken> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for op in ops {
        records::apply_op(&tx, op)?;
    }
    let sequence = history::append_transaction(&tx, author, Utc::now().timestamp_millis(), ops)?;
    tx.commit()?;
    Ok(ChangeToken::new(store_id, sequence))
}

fn validate_op(op: &ChangeOp) -> Result<(), ValidationError> {
    match op {
        ChangeOp::InsertFireball { fireball } => fireball.validate(),
        ChangeOp::InsertGroup { group } => group.validate(),
        ChangeOp::UpdateGroup { patch, .. } => match patch.name.as_deref() {
            Some(name) if name.trim().is_empty() => Err(ValidationError::EmptyGroupName),
            _ => Ok(()),
        },
        ChangeOp::UpdateFireball { .. }
        | ChangeOp::DeleteFireball { .. }
        | ChangeOp::DeleteGroup { .. } => Ok(()),
    }
}
