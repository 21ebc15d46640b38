//! Incremental replay of other writers' history into the view.
//!
//! # Responsibility
//! - Fetch transactions committed after the cursor by anyone but the
//!   foreground author.
//! - Hand them, oldest first, to the foreground queue for merging.
//! - Advance the in-memory and persisted cursor to the newest merged token.
//!
//! # Invariants
//! - At most one cycle runs at a time (one engine per worker thread).
//! - The cursor only advances after a successful merge.
//! - An empty fetch leaves the cursor untouched.

use crate::model::change::{ChangeToken, HistoryTransaction, FOREGROUND_AUTHOR};
use crate::repo::notify::StoreChange;
use crate::repo::store::{StoreAccess, StoreError};
use crate::sync::cursor::HistoryCursorStore;
use crossbeam::channel::{bounded, select, Receiver, Sender};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug)]
pub enum ReplayError {
    History(StoreError),
    /// The merge target shut down before accepting the batch.
    MergeTargetClosed,
}

impl Display for ReplayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::History(err) => write!(f, "history fetch failed: {err}"),
            Self::MergeTargetClosed => write!(f, "merge target is closed"),
        }
    }
}

impl Error for ReplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::History(err) => Some(err),
            Self::MergeTargetClosed => None,
        }
    }
}

impl From<StoreError> for ReplayError {
    fn from(value: StoreError) -> Self {
        Self::History(value)
    }
}

/// Receiver of replayed transactions; must serialize merges with local edits.
pub trait MergeTarget: Send {
    /// Merges `transactions` in order and returns once they are visible.
    fn merge(&self, transactions: Vec<HistoryTransaction>) -> Result<(), ReplayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    UpToDate,
    Merged {
        transactions: usize,
        token: ChangeToken,
    },
}

pub struct ChangeReplayEngine<S, M> {
    store: S,
    target: M,
    cursor: HistoryCursorStore,
    last_token: Option<ChangeToken>,
    excluding_author: String,
}

impl<S: StoreAccess, M: MergeTarget> ChangeReplayEngine<S, M> {
    /// Resumes from the persisted cursor, or from the start of history when
    /// it is missing or belongs to another store.
    pub fn new(store: S, target: M, cursor: HistoryCursorStore) -> Self {
        let last_token = match cursor.load() {
            Some(token) if token.store_id() == store.store_id() => Some(token),
            Some(token) => {
                warn!(
                    "event=replay_cursor module=sync status=discarded reason=foreign_store token_store={} store={}",
                    token.store_id(),
                    store.store_id()
                );
                None
            }
            None => None,
        };
        Self {
            store,
            target,
            cursor,
            last_token,
            excluding_author: FOREGROUND_AUTHOR.to_string(),
        }
    }

    /// Replays everything except transactions written by `author`.
    pub fn excluding_author(mut self, author: impl Into<String>) -> Self {
        self.excluding_author = author.into();
        self
    }

    pub fn last_token(&self) -> Option<ChangeToken> {
        self.last_token
    }

    pub fn run_cycle(&mut self) -> Result<ReplayOutcome, ReplayError> {
        let started_at = Instant::now();
        let transactions = self
            .store
            .history_after(self.last_token, &self.excluding_author)?;
        let Some(newest) = transactions.last().map(|transaction| transaction.token) else {
            debug!("event=replay_cycle module=sync status=up_to_date");
            return Ok(ReplayOutcome::UpToDate);
        };
        let count = transactions.len();

        self.target.merge(transactions)?;

        self.last_token = Some(newest);
        if let Err(err) = self.cursor.store(newest) {
            error!(
                "event=replay_cursor module=sync status=error sequence={} error={}",
                newest.sequence(),
                err
            );
        }
        info!(
            "event=replay_cycle module=sync status=ok transactions={} sequence={} duration_ms={}",
            count,
            newest.sequence(),
            started_at.elapsed().as_millis()
        );
        Ok(ReplayOutcome::Merged {
            transactions: count,
            token: newest,
        })
    }

    /// Runs one cycle and logs instead of returning failures.
    pub fn run_cycle_logged(&mut self) -> Option<ReplayOutcome> {
        match self.run_cycle() {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(
                    "event=replay_cycle module=sync status=error last_sequence={} error={}",
                    self.last_token.map_or(0, |token| token.sequence()),
                    err
                );
                None
            }
        }
    }
}

/// Handle of the dedicated replay thread.
pub struct ReplayWorker {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ReplayWorker {
    /// Stops the thread after any in-flight cycle and waits for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("event=replay_worker module=sync status=panicked");
            }
        }
    }
}

impl Drop for ReplayWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs `engine` on its own thread: one catch-up cycle at start, then one
/// cycle per received notification. Notifications arriving mid-cycle
/// coalesce in the bounded subscription slot.
pub fn spawn_replay_worker<S, M>(
    mut engine: ChangeReplayEngine<S, M>,
    notifications: Receiver<StoreChange>,
) -> std::io::Result<ReplayWorker>
where
    S: StoreAccess + 'static,
    M: MergeTarget + 'static,
{
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let handle = thread::Builder::new()
        .name("fireball-replay".to_string())
        .spawn(move || {
            info!("event=replay_worker module=sync status=started");
            engine.run_cycle_logged();
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(notifications) -> change => match change {
                        Ok(change) => {
                            debug!(
                                "event=replay_notify module=sync status=received sequence={}",
                                change.token.map_or(0, |token| token.sequence())
                            );
                            engine.run_cycle_logged();
                        }
                        Err(_) => break,
                    },
                }
            }
            info!("event=replay_worker module=sync status=stopped");
        })?;
    Ok(ReplayWorker {
        stop_tx,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::{ChangeReplayEngine, MergeTarget, ReplayError, ReplayOutcome};
    use crate::model::change::{ChangeOp, ChangeToken, HistoryTransaction};
    use crate::repo::store::{StoreAccess, StoreError, StoreResult, StoreSnapshot};
    use crate::sync::cursor::HistoryCursorStore;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    struct FakeHistory {
        store_id: Uuid,
        transactions: Vec<HistoryTransaction>,
        fail: Arc<Mutex<bool>>,
    }

    impl StoreAccess for FakeHistory {
        fn store_id(&self) -> Uuid {
            self.store_id
        }

        fn load_snapshot(&self) -> StoreResult<StoreSnapshot> {
            Ok(StoreSnapshot::default())
        }

        fn save(&mut self, _author: &str, _ops: &[ChangeOp]) -> StoreResult<Option<ChangeToken>> {
            Ok(None)
        }

        fn history_after(
            &self,
            after: Option<ChangeToken>,
            excluding_author: &str,
        ) -> StoreResult<Vec<HistoryTransaction>> {
            if *self.fail.lock().unwrap() {
                return Err(StoreError::InvalidData("simulated".to_string()));
            }
            Ok(self
                .transactions
                .iter()
                .filter(|transaction| after.map_or(true, |after| transaction.token > after))
                .filter(|transaction| transaction.author != excluding_author)
                .cloned()
                .collect())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        merged: Arc<Mutex<Vec<i64>>>,
    }

    impl MergeTarget for Recorder {
        fn merge(&self, transactions: Vec<HistoryTransaction>) -> Result<(), ReplayError> {
            let mut merged = self.merged.lock().unwrap();
            merged.extend(transactions.iter().map(|transaction| transaction.token.sequence()));
            Ok(())
        }
    }

    fn transaction(store_id: Uuid, sequence: i64, author: &str) -> HistoryTransaction {
        HistoryTransaction {
            token: ChangeToken::new(store_id, sequence),
            author: author.to_string(),
            committed_at_ms: sequence,
            changes: Vec::new(),
        }
    }

    #[test]
    fn cycle_skips_foreground_author_and_persists_newest_token() {
        let dir = tempfile::tempdir().unwrap();
        let store_id = Uuid::new_v4();
        let history = FakeHistory {
            store_id,
            transactions: vec![
                transaction(store_id, 1, "Fireball Data Import"),
                transaction(store_id, 2, "FireballWatch"),
                transaction(store_id, 3, "elsewhere"),
            ],
            fail: Arc::default(),
        };
        let recorder = Recorder::default();
        let cursor = HistoryCursorStore::new(dir.path(), "FireballWatch");
        let mut engine = ChangeReplayEngine::new(history, recorder.clone(), cursor.clone());

        let outcome = engine.run_cycle().unwrap();
        assert_eq!(
            outcome,
            ReplayOutcome::Merged {
                transactions: 2,
                token: ChangeToken::new(store_id, 3)
            }
        );
        assert_eq!(*recorder.merged.lock().unwrap(), vec![1, 3]);
        assert_eq!(cursor.load(), Some(ChangeToken::new(store_id, 3)));

        assert_eq!(engine.run_cycle().unwrap(), ReplayOutcome::UpToDate);
        assert_eq!(recorder.merged.lock().unwrap().len(), 2);
    }

    #[test]
    fn failed_fetch_leaves_cursor_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store_id = Uuid::new_v4();
        let fail = Arc::new(Mutex::new(true));
        let history = FakeHistory {
            store_id,
            transactions: vec![transaction(store_id, 7, "elsewhere")],
            fail: Arc::clone(&fail),
        };
        let cursor = HistoryCursorStore::new(dir.path(), "FireballWatch");
        let mut engine = ChangeReplayEngine::new(history, Recorder::default(), cursor.clone());

        assert!(matches!(engine.run_cycle(), Err(ReplayError::History(_))));
        assert_eq!(engine.last_token(), None);
        assert_eq!(cursor.load(), None);

        *fail.lock().unwrap() = false;
        assert!(matches!(
            engine.run_cycle().unwrap(),
            ReplayOutcome::Merged { transactions: 1, .. }
        ));
    }

    #[test]
    fn token_from_another_store_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = HistoryCursorStore::new(dir.path(), "FireballWatch");
        cursor.store(ChangeToken::new(Uuid::new_v4(), 40)).unwrap();

        let store_id = Uuid::new_v4();
        let history = FakeHistory {
            store_id,
            transactions: vec![transaction(store_id, 1, "elsewhere")],
            fail: Arc::default(),
        };
        let engine = ChangeReplayEngine::new(history, Recorder::default(), cursor);
        assert_eq!(engine.last_token(), None);
    }
}
