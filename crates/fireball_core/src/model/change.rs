//! Change-history model: operations, transactions, tokens and authors.
//!
//! # Responsibility
//! - Describe one atomic store write as an ordered list of `ChangeOp`s.
//! - Provide the opaque, ordered `ChangeToken` cursor into history.
//!
//! # Invariants
//! - Tokens of one store are totally ordered by `sequence`.
//! - Token bytes round-trip only through `to_bytes`/`from_bytes`.

use super::fireball::{Fireball, FireballId, FireballPatch};
use super::group::{FireballGroup, GroupId, GroupPatch};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author tag for ordinary foreground (view) writes.
pub const FOREGROUND_AUTHOR: &str = "FireballWatch";
/// Author tag for bulk imports of remote records.
pub const IMPORT_AUTHOR: &str = "Fireball Data Import";

const TOKEN_MAGIC: &[u8; 4] = b"FBHT";
const TOKEN_FORMAT_VERSION: u8 = 1;
const TOKEN_ENCODED_LEN: usize = 4 + 1 + 16 + 8;

/// Position in one store's change history.
///
/// Field order matters: derived ordering compares `sequence` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeToken {
    sequence: i64,
    store_id: Uuid,
}

impl ChangeToken {
    pub fn new(store_id: Uuid, sequence: i64) -> Self {
        Self { sequence, store_id }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TOKEN_ENCODED_LEN);
        bytes.extend_from_slice(TOKEN_MAGIC);
        bytes.push(TOKEN_FORMAT_VERSION);
        bytes.extend_from_slice(self.store_id.as_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes
    }

    /// Decodes bytes produced by `to_bytes`; anything else yields `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TOKEN_ENCODED_LEN
            || &bytes[..4] != TOKEN_MAGIC
            || bytes[4] != TOKEN_FORMAT_VERSION
        {
            return None;
        }
        let store_id = Uuid::from_slice(&bytes[5..21]).ok()?;
        let sequence = i64::from_be_bytes(bytes[21..29].try_into().ok()?);
        if sequence <= 0 {
            return None;
        }
        Some(Self { sequence, store_id })
    }
}

/// Identity of the object an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectRef {
    Fireball(FireballId),
    Group(GroupId),
}

/// One mutation inside a store transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    InsertFireball { fireball: Fireball },
    UpdateFireball { id: FireballId, patch: FireballPatch },
    DeleteFireball { id: FireballId },
    InsertGroup { group: FireballGroup },
    UpdateGroup { id: GroupId, patch: GroupPatch },
    DeleteGroup { id: GroupId },
}

impl ChangeOp {
    pub fn object(&self) -> ObjectRef {
        match self {
            Self::InsertFireball { fireball } => ObjectRef::Fireball(fireball.id),
            Self::UpdateFireball { id, .. } | Self::DeleteFireball { id } => {
                ObjectRef::Fireball(*id)
            }
            Self::InsertGroup { group } => ObjectRef::Group(group.id),
            Self::UpdateGroup { id, .. } | Self::DeleteGroup { id } => ObjectRef::Group(*id),
        }
    }

    /// Stable label stored in `history_changes.op`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsertFireball { .. } => "insert_fireball",
            Self::UpdateFireball { .. } => "update_fireball",
            Self::DeleteFireball { .. } => "delete_fireball",
            Self::InsertGroup { .. } => "insert_group",
            Self::UpdateGroup { .. } => "update_group",
            Self::DeleteGroup { .. } => "delete_group",
        }
    }
}

/// Committed store transaction as read back from history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryTransaction {
    pub token: ChangeToken,
    pub author: String,
    /// Unix epoch milliseconds.
    pub committed_at_ms: i64,
    pub changes: Vec<ChangeOp>,
}
