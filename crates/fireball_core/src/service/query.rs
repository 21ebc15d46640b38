//! Read-side query options for the fireball view.

use crate::model::fireball::Fireball;
use crate::model::group::GroupId;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FireballSort {
    #[default]
    NewestFirst,
    OldestFirst,
    LargestImpactFirst,
}

/// Filter, sort and limit options for listing fireballs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireballQuery {
    pub sort: FireballSort,
    /// Only records that belong to this group.
    pub group: Option<GroupId>,
    /// Only records whose impact magnitude is at least this value.
    pub min_magnitude: Option<u8>,
    pub limit: Option<usize>,
}

impl FireballQuery {
    pub fn in_group(group: GroupId) -> Self {
        Self {
            group: Some(group),
            ..Self::default()
        }
    }

    pub fn matches(&self, fireball: &Fireball) -> bool {
        if let Some(group) = self.group {
            if !fireball.groups.contains(&group) {
                return false;
            }
        }
        if let Some(min) = self.min_magnitude {
            if fireball.impact_energy_magnitude() < min {
                return false;
            }
        }
        true
    }

    /// Filters, sorts and truncates `fireballs` in place.
    pub fn apply(&self, fireballs: &mut Vec<Fireball>) {
        fireballs.retain(|fireball| self.matches(fireball));
        fireballs.sort_by(|left, right| self.compare(left, right));
        if let Some(limit) = self.limit {
            fireballs.truncate(limit);
        }
    }

    fn compare(&self, left: &Fireball, right: &Fireball) -> Ordering {
        let primary = match self.sort {
            FireballSort::NewestFirst => right.data.timestamp.cmp(&left.data.timestamp),
            FireballSort::OldestFirst => left.data.timestamp.cmp(&right.data.timestamp),
            FireballSort::LargestImpactFirst => right
                .data
                .impact_energy
                .total_cmp(&left.data.impact_energy),
        };
        primary.then_with(|| left.id.cmp(&right.id))
    }
}
