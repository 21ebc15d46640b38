//! Conflict resolution between pending local edits and merged-in history.
//!
//! # Responsibility
//! - Decide, per field, whether a pending local edit or an incoming
//!   committed value is visible after a merge.
//! - Keep fields saved locally from being overwritten by older foreign
//!   transactions that are replayed later.
//!
//! # Invariants
//! - Under `PropertyObjectTrump` a pending field always stays visible;
//!   committed state fills in every field the pending edit does not touch.
//! - A foreign change never overwrites a field stamped by a newer local save.
//! - The rules are the same for foreground- and import-authored history.

use crate::model::change::ChangeToken;
use crate::model::fireball::{FireballField, FireballId, FireballPatch};
use crate::model::group::{GroupField, GroupId, GroupPatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field-level merge rule applied when history is merged into the view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Pending local edits win over incoming values for the same field.
    #[default]
    PropertyObjectTrump,
    /// Incoming values win; the matching pending field is discarded.
    PropertyStoreTrump,
}

impl MergePolicy {
    /// Reconciles a pending record edit with an incoming committed patch.
    ///
    /// Committed state always takes `incoming`; this only decides what
    /// happens to the overlay.
    pub fn resolve_fireball(self, pending: &mut FireballPatch, incoming: &FireballPatch) {
        if self == Self::PropertyStoreTrump {
            pending.retain(|field| !incoming.touches(field));
        }
    }

    pub fn resolve_group(self, pending: &mut GroupPatch, incoming: &GroupPatch) {
        if self == Self::PropertyStoreTrump {
            pending.retain(|field| !incoming.touches(field));
        }
    }
}

/// Tokens of the most recent local save per object field.
///
/// The view applies its own saves without waiting for replay, so a foreign
/// transaction committed before such a save may still be replayed after it.
#[derive(Debug, Default)]
pub struct SaveWatermarks {
    fireballs: BTreeMap<FireballId, BTreeMap<FireballField, ChangeToken>>,
    groups: BTreeMap<GroupId, BTreeMap<GroupField, ChangeToken>>,
}

impl SaveWatermarks {
    pub fn stamp_fireball(&mut self, id: FireballId, patch: &FireballPatch, token: ChangeToken) {
        let stamps = self.fireballs.entry(id).or_default();
        for field in patch.touched_fields() {
            stamps.insert(field, token);
        }
    }

    pub fn stamp_group(&mut self, id: GroupId, patch: &GroupPatch, token: ChangeToken) {
        let stamps = self.groups.entry(id).or_default();
        for field in patch.touched_fields() {
            stamps.insert(field, token);
        }
    }

    /// Removes fields from `incoming` that a newer local save already wrote.
    pub fn filter_fireball(&self, id: FireballId, at: ChangeToken, incoming: &mut FireballPatch) {
        if let Some(stamps) = self.fireballs.get(&id) {
            incoming.retain(|field| stamps.get(&field).map_or(true, |saved| *saved < at));
        }
    }

    pub fn filter_group(&self, id: GroupId, at: ChangeToken, incoming: &mut GroupPatch) {
        if let Some(stamps) = self.groups.get(&id) {
            incoming.retain(|field| stamps.get(&field).map_or(true, |saved| *saved < at));
        }
    }

    pub fn forget_fireball(&mut self, id: FireballId) {
        self.fireballs.remove(&id);
    }

    pub fn forget_group(&mut self, id: GroupId) {
        self.groups.remove(&id);
    }

    /// Drops stamps at or below `token`: replay has moved past them, so no
    /// older foreign transaction can arrive any more.
    pub fn prune_through(&mut self, token: ChangeToken) {
        for stamps in self.fireballs.values_mut() {
            stamps.retain(|_, saved| *saved > token);
        }
        self.fireballs.retain(|_, stamps| !stamps.is_empty());
        for stamps in self.groups.values_mut() {
            stamps.retain(|_, saved| *saved > token);
        }
        self.groups.retain(|_, stamps| !stamps.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.fireballs.is_empty() && self.groups.is_empty()
    }
}
