//! Fireball group model.
//!
//! # Invariants
//! - A user-created group always has a non-empty (trimmed) name.
//! - Membership lives on `Fireball::groups`; a group stores only its name.

use super::ValidationError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type GroupId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireballGroup {
    pub id: GroupId,
    pub name: String,
}

impl FireballGroup {
    /// Creates a group with a generated identity. The name is trimmed.
    pub fn new(name: impl AsRef<str>) -> Result<Self, ValidationError> {
        let group = Self {
            id: Uuid::new_v4(),
            name: name.as_ref().trim().to_string(),
        };
        group.validate()?;
        Ok(group)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyGroupName);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupField {
    Name,
}

/// Partial group write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl GroupPatch {
    pub fn from_group(group: &FireballGroup) -> Self {
        Self {
            name: Some(group.name.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
    }

    pub fn touched_fields(&self) -> Vec<GroupField> {
        if self.name.is_some() {
            vec![GroupField::Name]
        } else {
            Vec::new()
        }
    }

    pub fn touches(&self, field: GroupField) -> bool {
        match field {
            GroupField::Name => self.name.is_some(),
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(GroupField) -> bool) {
        if self.name.is_some() && !keep(GroupField::Name) {
            self.name = None;
        }
    }

    pub fn absorb(&mut self, newer: &GroupPatch) {
        if let Some(name) = newer.name.as_ref() {
            self.name = Some(name.clone());
        }
    }

    pub fn apply_to(&self, group: &mut FireballGroup) {
        if let Some(name) = self.name.as_ref() {
            group.name = name.clone();
        }
    }
}
