//! Queryable in-memory view of the store.
//!
//! # Responsibility
//! - Hold the committed snapshot the collaborator reads from.
//! - Stage local edits until they are saved as one foreground transaction.
//! - Merge replayed history transactions, applying `MergePolicy`.
//!
//! # Invariants
//! - Reads always show committed state overlaid with pending edits.
//! - Transactions at or below the snapshot anchor are never re-applied.
//! - Merging the same transactions twice leaves the view unchanged.
//! - This type performs no I/O; it is owned by the foreground queue.

use crate::model::change::{ChangeOp, ChangeToken, HistoryTransaction, ObjectRef};
use crate::model::fireball::{Fireball, FireballId, FireballPatch};
use crate::model::group::{FireballGroup, GroupId, GroupPatch};
use crate::model::ValidationError;
use crate::repo::store::StoreSnapshot;
use crate::service::query::FireballQuery;
use crate::sync::conflict::{MergePolicy, SaveWatermarks};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome counters of one merge call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub merged_transactions: usize,
    /// Transactions already contained in the loaded snapshot.
    pub skipped_transactions: usize,
    pub applied_ops: usize,
    /// Updates for objects this view does not know (e.g. deleted meanwhile).
    pub ignored_ops: usize,
}

#[derive(Debug, Default)]
struct PendingChanges {
    inserted_fireballs: BTreeMap<FireballId, Fireball>,
    inserted_groups: BTreeMap<GroupId, FireballGroup>,
    fireball_edits: BTreeMap<FireballId, FireballPatch>,
    group_edits: BTreeMap<GroupId, GroupPatch>,
    deleted: BTreeSet<ObjectRef>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.inserted_fireballs.is_empty()
            && self.inserted_groups.is_empty()
            && self.fireball_edits.is_empty()
            && self.group_edits.is_empty()
            && self.deleted.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ViewContext {
    policy: MergePolicy,
    anchor: Option<ChangeToken>,
    fireballs: BTreeMap<FireballId, Fireball>,
    groups: BTreeMap<GroupId, FireballGroup>,
    pending: PendingChanges,
    watermarks: SaveWatermarks,
}

impl ViewContext {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Builds a view whose committed state is `snapshot`, anchored at its head.
    pub fn from_snapshot(snapshot: StoreSnapshot, policy: MergePolicy) -> Self {
        Self {
            policy,
            anchor: snapshot.head,
            fireballs: snapshot
                .fireballs
                .into_iter()
                .map(|fireball| (fireball.id, fireball))
                .collect(),
            groups: snapshot
                .groups
                .into_iter()
                .map(|group| (group.id, group))
                .collect(),
            ..Self::default()
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn anchor(&self) -> Option<ChangeToken> {
        self.anchor
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    // -- local edits ---------------------------------------------------------

    pub fn insert_fireball(&mut self, fireball: Fireball) -> Result<FireballId, ValidationError> {
        fireball.validate()?;
        let id = fireball.id;
        self.pending.inserted_fireballs.insert(id, fireball);
        Ok(id)
    }

    pub fn insert_group(&mut self, group: FireballGroup) -> Result<GroupId, ValidationError> {
        group.validate()?;
        let id = group.id;
        self.pending.inserted_groups.insert(id, group);
        Ok(id)
    }

    /// Stages a field-level edit. Returns `false` when the record is not
    /// visible.
    pub fn edit_fireball(&mut self, id: FireballId, patch: FireballPatch) -> bool {
        if self.pending.deleted.contains(&ObjectRef::Fireball(id)) {
            return false;
        }
        if let Some(inserted) = self.pending.inserted_fireballs.get_mut(&id) {
            patch.apply_to(inserted);
            return true;
        }
        if !self.fireballs.contains_key(&id) {
            return false;
        }
        self.pending
            .fireball_edits
            .entry(id)
            .or_default()
            .absorb(&patch);
        true
    }

    /// Stages a group edit; a new name is stored trimmed.
    pub fn edit_group(
        &mut self,
        id: GroupId,
        mut patch: GroupPatch,
    ) -> Result<bool, ValidationError> {
        if let Some(name) = patch.name.as_mut() {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(ValidationError::EmptyGroupName);
            }
            *name = trimmed.to_string();
        }
        if self.pending.deleted.contains(&ObjectRef::Group(id)) {
            return Ok(false);
        }
        if let Some(inserted) = self.pending.inserted_groups.get_mut(&id) {
            patch.apply_to(inserted);
            return Ok(true);
        }
        if !self.groups.contains_key(&id) {
            return Ok(false);
        }
        self.pending.group_edits.entry(id).or_default().absorb(&patch);
        Ok(true)
    }

    /// Stages deletion of one object. Returns `false` when it is not visible.
    pub fn delete(&mut self, object: ObjectRef) -> bool {
        match object {
            ObjectRef::Fireball(id) => {
                if self.pending.inserted_fireballs.remove(&id).is_some() {
                    return true;
                }
                if !self.fireballs.contains_key(&id) {
                    return false;
                }
                self.pending.fireball_edits.remove(&id);
            }
            ObjectRef::Group(id) => {
                if self.pending.inserted_groups.remove(&id).is_some() {
                    return true;
                }
                if !self.groups.contains_key(&id) {
                    return false;
                }
                self.pending.group_edits.remove(&id);
            }
        }
        self.pending.deleted.insert(object)
    }

    /// Pending edits as store operations, ordered so that referenced groups
    /// exist before memberships are written.
    pub fn pending_ops(&self) -> Vec<ChangeOp> {
        let pending = &self.pending;
        let mut ops = Vec::new();
        ops.extend(
            pending
                .inserted_groups
                .values()
                .map(|group| ChangeOp::InsertGroup {
                    group: group.clone(),
                }),
        );
        ops.extend(
            pending
                .inserted_fireballs
                .values()
                .map(|fireball| ChangeOp::InsertFireball {
                    fireball: fireball.clone(),
                }),
        );
        ops.extend(
            pending
                .group_edits
                .iter()
                .filter(|(_, patch)| !patch.is_empty())
                .map(|(id, patch)| ChangeOp::UpdateGroup {
                    id: *id,
                    patch: patch.clone(),
                }),
        );
        ops.extend(
            pending
                .fireball_edits
                .iter()
                .filter(|(_, patch)| !patch.is_empty())
                .map(|(id, patch)| ChangeOp::UpdateFireball {
                    id: *id,
                    patch: patch.clone(),
                }),
        );
        for object in &pending.deleted {
            if let ObjectRef::Fireball(id) = object {
                ops.push(ChangeOp::DeleteFireball { id: *id });
            }
        }
        for object in &pending.deleted {
            if let ObjectRef::Group(id) = object {
                ops.push(ChangeOp::DeleteGroup { id: *id });
            }
        }
        ops
    }

    /// Folds pending edits into committed state after a successful save at
    /// `token`.
    pub fn commit_pending(&mut self, token: ChangeToken) {
        let pending = std::mem::take(&mut self.pending);

        for (id, group) in pending.inserted_groups {
            self.groups.insert(id, group);
        }
        for (id, fireball) in pending.inserted_fireballs {
            self.fireballs.insert(id, fireball);
        }
        for (id, patch) in pending.group_edits {
            if let Some(group) = self.groups.get_mut(&id) {
                patch.apply_to(group);
                self.watermarks.stamp_group(id, &patch, token);
            }
        }
        for (id, patch) in pending.fireball_edits {
            if let Some(fireball) = self.fireballs.get_mut(&id) {
                patch.apply_to(fireball);
                self.watermarks.stamp_fireball(id, &patch, token);
            }
        }
        for object in pending.deleted {
            self.remove_committed(object);
        }
    }

    // -- history merge ---------------------------------------------------------

    /// Merges transactions in the given (oldest-to-newest) order.
    pub fn merge_transactions(&mut self, transactions: &[HistoryTransaction]) -> MergeStats {
        let mut stats = MergeStats::default();
        for transaction in transactions {
            if self
                .anchor
                .is_some_and(|anchor| transaction.token <= anchor)
            {
                stats.skipped_transactions += 1;
                continue;
            }
            for op in &transaction.changes {
                if self.merge_op(transaction.token, op) {
                    stats.applied_ops += 1;
                } else {
                    stats.ignored_ops += 1;
                }
            }
            stats.merged_transactions += 1;
        }
        if let Some(last) = transactions.last() {
            self.watermarks.prune_through(last.token);
        }
        stats
    }

    fn merge_op(&mut self, token: ChangeToken, op: &ChangeOp) -> bool {
        match op {
            ChangeOp::InsertFireball { fireball } => {
                if self.fireballs.contains_key(&fireball.id) {
                    self.merge_fireball_patch(
                        fireball.id,
                        token,
                        FireballPatch::from_fireball(fireball),
                    )
                } else {
                    self.fireballs.insert(fireball.id, fireball.clone());
                    true
                }
            }
            ChangeOp::UpdateFireball { id, patch } => {
                self.merge_fireball_patch(*id, token, patch.clone())
            }
            ChangeOp::InsertGroup { group } => {
                if self.groups.contains_key(&group.id) {
                    self.merge_group_patch(group.id, token, GroupPatch::from_group(group))
                } else {
                    self.groups.insert(group.id, group.clone());
                    true
                }
            }
            ChangeOp::UpdateGroup { id, patch } => {
                self.merge_group_patch(*id, token, patch.clone())
            }
            ChangeOp::DeleteFireball { id } => {
                let object = ObjectRef::Fireball(*id);
                self.pending.deleted.remove(&object);
                self.pending.fireball_edits.remove(id);
                self.remove_committed(object)
            }
            ChangeOp::DeleteGroup { id } => {
                let object = ObjectRef::Group(*id);
                self.pending.deleted.remove(&object);
                self.pending.group_edits.remove(id);
                for patch in self.pending.fireball_edits.values_mut() {
                    if let Some(groups) = patch.groups.as_mut() {
                        groups.remove(id);
                    }
                }
                self.remove_committed(object)
            }
        }
    }

    fn merge_fireball_patch(
        &mut self,
        id: FireballId,
        token: ChangeToken,
        mut incoming: FireballPatch,
    ) -> bool {
        let Some(fireball) = self.fireballs.get_mut(&id) else {
            return false;
        };
        self.watermarks.filter_fireball(id, token, &mut incoming);
        incoming.apply_to(fireball);
        if let Some(pending) = self.pending.fireball_edits.get_mut(&id) {
            self.policy.resolve_fireball(pending, &incoming);
            if pending.is_empty() {
                self.pending.fireball_edits.remove(&id);
            }
        }
        true
    }

    fn merge_group_patch(&mut self, id: GroupId, token: ChangeToken, mut incoming: GroupPatch) -> bool {
        let Some(group) = self.groups.get_mut(&id) else {
            return false;
        };
        self.watermarks.filter_group(id, token, &mut incoming);
        incoming.apply_to(group);
        if let Some(pending) = self.pending.group_edits.get_mut(&id) {
            self.policy.resolve_group(pending, &incoming);
            if pending.is_empty() {
                self.pending.group_edits.remove(&id);
            }
        }
        true
    }

    fn remove_committed(&mut self, object: ObjectRef) -> bool {
        match object {
            ObjectRef::Fireball(id) => {
                self.watermarks.forget_fireball(id);
                self.fireballs.remove(&id).is_some()
            }
            ObjectRef::Group(id) => {
                self.watermarks.forget_group(id);
                for fireball in self.fireballs.values_mut() {
                    fireball.groups.remove(&id);
                }
                self.groups.remove(&id).is_some()
            }
        }
    }

    // -- reads -------------------------------------------------------------------

    /// Visible record: committed state overlaid with pending edits.
    pub fn fireball(&self, id: FireballId) -> Option<Fireball> {
        if let Some(inserted) = self.pending.inserted_fireballs.get(&id) {
            return Some(self.with_visible_groups(inserted.clone()));
        }
        if self.pending.deleted.contains(&ObjectRef::Fireball(id)) {
            return None;
        }
        let mut fireball = self.fireballs.get(&id)?.clone();
        if let Some(patch) = self.pending.fireball_edits.get(&id) {
            patch.apply_to(&mut fireball);
        }
        Some(self.with_visible_groups(fireball))
    }

    pub fn fireballs(&self, query: &FireballQuery) -> Vec<Fireball> {
        let mut visible: Vec<Fireball> = self
            .fireballs
            .keys()
            .chain(self.pending.inserted_fireballs.keys())
            .filter_map(|id| self.fireball(*id))
            .collect();
        query.apply(&mut visible);
        visible
    }

    pub fn fireball_count(&self) -> usize {
        self.fireballs(&FireballQuery::default()).len()
    }

    pub fn group(&self, id: GroupId) -> Option<FireballGroup> {
        if let Some(inserted) = self.pending.inserted_groups.get(&id) {
            return Some(inserted.clone());
        }
        if self.pending.deleted.contains(&ObjectRef::Group(id)) {
            return None;
        }
        let mut group = self.groups.get(&id)?.clone();
        if let Some(patch) = self.pending.group_edits.get(&id) {
            patch.apply_to(&mut group);
        }
        Some(group)
    }

    /// Visible groups sorted by name.
    pub fn groups(&self) -> Vec<FireballGroup> {
        let mut visible: Vec<FireballGroup> = self
            .groups
            .keys()
            .chain(self.pending.inserted_groups.keys())
            .filter_map(|id| self.group(*id))
            .collect();
        visible.sort_by(|left, right| left.name.cmp(&right.name).then(left.id.cmp(&right.id)));
        visible
    }

    fn with_visible_groups(&self, mut fireball: Fireball) -> Fireball {
        fireball.groups.retain(|id| self.group(*id).is_some());
        fireball
    }
}
