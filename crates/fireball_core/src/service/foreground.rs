//! Serial foreground queue owning the view and its store connection.
//!
//! # Responsibility
//! - Execute collaborator reads, local edits and replay merges one at a
//!   time on a single thread.
//! - Save staged edits as foreground-authored transactions.
//!
//! # Invariants
//! - `ForegroundState` is only ever touched from the queue thread.
//! - Tasks run in submission order; merges never interleave with edits.
//! - A failed save keeps the staged edits for the next save.
//! - Reads never touch SQLite. A save waits for the store's write lock, so
//!   tasks queued behind it wait up to the busy timeout while another
//!   writer (e.g. a large bulk import) holds that lock.

use crate::model::change::{ChangeToken, HistoryTransaction};
use crate::repo::store::{StoreAccess, StoreError};
use crate::service::view_context::ViewContext;
use crate::sync::replay::{MergeTarget, ReplayError};
use crossbeam::channel::{bounded, unbounded, Sender};
use log::{debug, error};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::thread::{self, JoinHandle};

/// The foreground queue has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextClosed;

impl Display for ContextClosed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "foreground context is closed")
    }
}

impl Error for ContextClosed {}

/// State owned by the foreground thread.
pub struct ForegroundState {
    pub view: ViewContext,
    store: Box<dyn StoreAccess>,
    author: String,
}

impl ForegroundState {
    /// Saves staged edits as one transaction. `Ok(None)` when nothing was
    /// staged.
    pub fn save(&mut self) -> Result<Option<ChangeToken>, StoreError> {
        let ops = self.view.pending_ops();
        if ops.is_empty() {
            return Ok(None);
        }
        match self.store.save(&self.author, &ops)? {
            Some(token) => {
                self.view.commit_pending(token);
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }
}

type Task = Box<dyn FnOnce(&mut ForegroundState) + Send>;

enum Command {
    Run(Task),
    Shutdown,
}

/// Cloneable submission handle of the foreground queue.
#[derive(Clone)]
pub struct ForegroundHandle {
    tx: Sender<Command>,
}

impl ForegroundHandle {
    /// Enqueues `task` without waiting for it.
    pub fn perform<F>(&self, task: F) -> Result<(), ContextClosed>
    where
        F: FnOnce(&mut ForegroundState) + Send + 'static,
    {
        self.tx
            .send(Command::Run(Box::new(task)))
            .map_err(|_| ContextClosed)
    }

    /// Enqueues `task` and blocks until it has run on the queue.
    pub fn perform_and_wait<F, R>(&self, task: F) -> Result<R, ContextClosed>
    where
        F: FnOnce(&mut ForegroundState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        self.perform(move |state| {
            let _ = reply_tx.send(task(state));
        })?;
        reply_rx.recv().map_err(|_| ContextClosed)
    }
}

impl MergeTarget for ForegroundHandle {
    fn merge(&self, transactions: Vec<HistoryTransaction>) -> Result<(), ReplayError> {
        let stats = self
            .perform_and_wait(move |state| state.view.merge_transactions(&transactions))
            .map_err(|_| ReplayError::MergeTargetClosed)?;
        debug!(
            "event=view_merge module=service status=ok merged={} skipped={} applied_ops={} ignored_ops={}",
            stats.merged_transactions,
            stats.skipped_transactions,
            stats.applied_ops,
            stats.ignored_ops
        );
        Ok(())
    }
}

/// Owner of the foreground thread.
pub struct ForegroundContext {
    handle: ForegroundHandle,
    thread: Option<JoinHandle<()>>,
}

impl ForegroundContext {
    /// Starts the queue thread with `view` and the connection it saves
    /// through.
    pub fn spawn(
        view: ViewContext,
        store: Box<dyn StoreAccess>,
        author: impl Into<String>,
    ) -> io::Result<Self> {
        let mut state = ForegroundState {
            view,
            store,
            author: author.into(),
        };

        let (tx, rx) = unbounded::<Command>();
        let thread = thread::Builder::new()
            .name("fireball-foreground".to_string())
            .spawn(move || {
                for command in rx {
                    match command {
                        Command::Run(task) => task(&mut state),
                        Command::Shutdown => break,
                    }
                }
                if state.view.has_changes() {
                    if let Err(err) = state.save() {
                        error!(
                            "event=view_save module=service status=error phase=shutdown error={}",
                            err
                        );
                    }
                }
            })?;

        Ok(Self {
            handle: ForegroundHandle { tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ForegroundHandle {
        self.handle.clone()
    }

    pub fn perform<F>(&self, task: F) -> Result<(), ContextClosed>
    where
        F: FnOnce(&mut ForegroundState) + Send + 'static,
    {
        self.handle.perform(task)
    }

    pub fn perform_and_wait<F, R>(&self, task: F) -> Result<R, ContextClosed>
    where
        F: FnOnce(&mut ForegroundState) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.perform_and_wait(task)
    }

    /// Drains queued tasks, saves leftover edits and joins the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event=foreground_queue module=service status=panicked");
            }
        }
    }
}

impl Drop for ForegroundContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextClosed, ForegroundContext};
    use crate::model::change::FOREGROUND_AUTHOR;
    use crate::model::group::FireballGroup;
    use crate::repo::store::{PersistentStore, StoreAccess};
    use crate::service::view_context::ViewContext;

    fn spawn(store: &PersistentStore) -> ForegroundContext {
        ForegroundContext::spawn(
            ViewContext::default(),
            Box::new(store.connect().unwrap()),
            FOREGROUND_AUTHOR,
        )
        .unwrap()
    }

    #[test]
    fn tasks_run_in_order_and_saves_are_foreground_authored() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join("fireballs.sqlite")).unwrap();
        let context = spawn(&store);

        context
            .perform(|state| {
                state
                    .view
                    .insert_group(FireballGroup::new("alpha").unwrap())
                    .unwrap();
            })
            .unwrap();
        let token = context
            .perform_and_wait(|state| state.save().unwrap())
            .unwrap();
        assert!(token.is_some());

        let history = store.connect().unwrap().history_after(None, "nobody").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, FOREGROUND_AUTHOR);
        context.shutdown();
    }

    #[test]
    fn handle_reports_closed_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join("fireballs.sqlite")).unwrap();
        let context = spawn(&store);
        let handle = context.handle();
        context.shutdown();
        assert_eq!(handle.perform_and_wait(|_| ()), Err(ContextClosed));
    }
}
