//! Store mutation notifications.
//!
//! # Invariants
//! - Delivery is at-least-once per commit and never blocks the writer.
//! - Each subscriber has a single pending slot; a notification arriving while
//!   the slot is full is coalesced into the pending one.

use crate::model::change::ChangeToken;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::trace;
use std::sync::{Arc, Mutex, MutexGuard};

const SUBSCRIBER_SLOTS: usize = 1;

/// "The store was mutated" signal. `token` is `None` when the mutation came
/// from outside this process and its position is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub token: Option<ChangeToken>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreNotifier {
    subscribers: Arc<Mutex<Vec<Sender<StoreChange>>>>,
}

impl StoreNotifier {
    pub fn subscribe(&self) -> Receiver<StoreChange> {
        let (tx, rx) = bounded(SUBSCRIBER_SLOTS);
        self.lock().push(tx);
        rx
    }

    pub fn notify(&self, change: StoreChange) {
        self.lock().retain(|subscriber| match subscriber.try_send(change) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("event=store_notify module=repo status=coalesced");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<StoreChange>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
