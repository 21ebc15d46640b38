//! Append-only change history SQL.
//!
//! # Invariants
//! - One `history_transactions` row per committed store transaction; its
//!   AUTOINCREMENT `sequence` is the token position and never reused.
//! - SQLite admits one writer at a time, so sequence order is commit order.
//! - `history_changes.position` preserves op order inside a transaction.

use super::records::parse_uuid;
use super::store::{StoreError, StoreResult};
use crate::model::change::{ChangeOp, ChangeToken, HistoryTransaction, ObjectRef};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const STORE_ID_KEY: &str = "store_id";

/// Records `ops` as one history transaction and returns its sequence.
pub(crate) fn append_transaction(
    conn: &Connection,
    author: &str,
    committed_at_ms: i64,
    ops: &[ChangeOp],
) -> StoreResult<i64> {
    conn.prepare_cached("INSERT INTO history_transactions (author, committed_at) VALUES (?1, ?2);")?
        .execute(params![author, committed_at_ms])?;
    let sequence = conn.last_insert_rowid();

    let mut insert = conn.prepare_cached(
        "INSERT INTO history_changes (sequence, position, op, object_uuid, payload)
         VALUES (?1, ?2, ?3, ?4, ?5);",
    )?;
    for (position, op) in ops.iter().enumerate() {
        let object_uuid = match op.object() {
            ObjectRef::Fireball(id) | ObjectRef::Group(id) => id.to_string(),
        };
        let payload = serde_json::to_string(op)?;
        insert.execute(params![
            sequence,
            position as i64,
            op.kind(),
            object_uuid,
            payload
        ])?;
    }

    Ok(sequence)
}

/// Reads transactions after `after` (all when `None`), excluding one author,
/// oldest first.
pub(crate) fn transactions_after(
    conn: &Connection,
    store_id: Uuid,
    after: Option<ChangeToken>,
    excluding_author: &str,
) -> StoreResult<Vec<HistoryTransaction>> {
    let after_sequence = after.map_or(0, |token| token.sequence());
    let mut stmt = conn.prepare_cached(
        "SELECT t.sequence, t.author, t.committed_at, c.payload
         FROM history_transactions t
         LEFT JOIN history_changes c ON c.sequence = t.sequence
         WHERE t.sequence > ?1
           AND t.author <> ?2
         ORDER BY t.sequence ASC, c.position ASC;",
    )?;
    let mut rows = stmt.query(params![after_sequence, excluding_author])?;

    let mut transactions: Vec<HistoryTransaction> = Vec::new();
    while let Some(row) = rows.next()? {
        let sequence: i64 = row.get(0)?;
        let payload: Option<String> = row.get(3)?;

        let starts_new = transactions
            .last()
            .map_or(true, |last| last.token.sequence() != sequence);
        if starts_new {
            transactions.push(HistoryTransaction {
                token: ChangeToken::new(store_id, sequence),
                author: row.get(1)?,
                committed_at_ms: row.get(2)?,
                changes: Vec::new(),
            });
        }

        if let (Some(payload), Some(current)) = (payload, transactions.last_mut()) {
            let op: ChangeOp = serde_json::from_str(&payload).map_err(|err| {
                StoreError::InvalidData(format!(
                    "invalid change payload in history sequence {sequence}: {err}"
                ))
            })?;
            current.changes.push(op);
        }
    }

    Ok(transactions)
}

pub(crate) fn head_token(conn: &Connection, store_id: Uuid) -> StoreResult<Option<ChangeToken>> {
    let head: Option<i64> =
        conn.query_row("SELECT MAX(sequence) FROM history_transactions;", [], |row| {
            row.get(0)
        })?;
    Ok(head.map(|sequence| ChangeToken::new(store_id, sequence)))
}

/// Returns the store identity, creating it on first open.
pub(crate) fn ensure_store_id(conn: &Connection) -> StoreResult<Uuid> {
    conn.execute(
        "INSERT OR IGNORE INTO store_metadata (key, value) VALUES (?1, ?2);",
        params![STORE_ID_KEY, Uuid::new_v4().to_string()],
    )?;
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM store_metadata WHERE key = ?1;",
            [STORE_ID_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(value) => parse_uuid(&value, "store_metadata.store_id"),
        None => Err(StoreError::InvalidData(
            "store_metadata.store_id is missing".to_string(),
        )),
    }
}
