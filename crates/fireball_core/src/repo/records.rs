//! SQL for fireball and group rows.
//!
//! # Invariants
//! - Callers run writes inside the store transaction that also appends the
//!   history entry; nothing here commits.
//! - Updates and deletes of rows removed by another writer are no-ops.
//! - Membership rows pointing at vanished groups are skipped, not failed.

use super::store::{StoreError, StoreResult};
use crate::model::change::ChangeOp;
use crate::model::fireball::{Fireball, FireballData, FireballId, FireballPatch};
use crate::model::group::{FireballGroup, GroupId, GroupPatch};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub(crate) fn apply_op(conn: &Connection, op: &ChangeOp) -> StoreResult<()> {
    match op {
        ChangeOp::InsertFireball { fireball } => insert_fireball(conn, fireball),
        ChangeOp::UpdateFireball { id, patch } => update_fireball(conn, *id, patch),
        ChangeOp::DeleteFireball { id } => {
            conn.prepare_cached("DELETE FROM fireballs WHERE uuid = ?1;")?
                .execute([id.to_string()])?;
            Ok(())
        }
        ChangeOp::InsertGroup { group } => {
            conn.prepare_cached("INSERT INTO fireball_groups (uuid, name) VALUES (?1, ?2);")?
                .execute(params![group.id.to_string(), group.name.as_str()])?;
            Ok(())
        }
        ChangeOp::UpdateGroup { id, patch } => update_group(conn, *id, patch),
        ChangeOp::DeleteGroup { id } => {
            conn.prepare_cached("DELETE FROM fireball_groups WHERE uuid = ?1;")?
                .execute([id.to_string()])?;
            Ok(())
        }
    }
}

fn insert_fireball(conn: &Connection, fireball: &Fireball) -> StoreResult<()> {
    let data = &fireball.data;
    conn.prepare_cached(
        "INSERT INTO fireballs (
            uuid,
            occurred_at,
            latitude,
            longitude,
            altitude,
            velocity,
            radiated_energy,
            impact_energy
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
    )?
    .execute(params![
        fireball.id.to_string(),
        data.timestamp.timestamp_millis(),
        data.latitude,
        data.longitude,
        data.altitude,
        data.velocity,
        data.radiated_energy,
        data.impact_energy,
    ])?;

    if !fireball.groups.is_empty() {
        replace_memberships(conn, fireball.id, &fireball.groups)?;
    }
    Ok(())
}

fn update_fireball(conn: &Connection, id: FireballId, patch: &FireballPatch) -> StoreResult<()> {
    let id_text = id.to_string();
    // COALESCE keeps untouched columns: only the patched fields are written.
    conn.prepare_cached(
        "UPDATE fireballs
         SET
            occurred_at = COALESCE(?2, occurred_at),
            latitude = COALESCE(?3, latitude),
            longitude = COALESCE(?4, longitude),
            altitude = COALESCE(?5, altitude),
            velocity = COALESCE(?6, velocity),
            radiated_energy = COALESCE(?7, radiated_energy),
            impact_energy = COALESCE(?8, impact_energy)
         WHERE uuid = ?1;",
    )?
    .execute(params![
        id_text.as_str(),
        patch.timestamp.map(|value| value.timestamp_millis()),
        patch.latitude,
        patch.longitude,
        patch.altitude,
        patch.velocity,
        patch.radiated_energy,
        patch.impact_energy,
    ])?;

    if let Some(groups) = patch.groups.as_ref() {
        replace_memberships(conn, id, groups)?;
    }
    Ok(())
}

fn update_group(conn: &Connection, id: GroupId, patch: &GroupPatch) -> StoreResult<()> {
    if let Some(name) = patch.name.as_deref() {
        conn.prepare_cached("UPDATE fireball_groups SET name = ?2 WHERE uuid = ?1;")?
            .execute(params![id.to_string(), name])?;
    }
    Ok(())
}

fn replace_memberships(
    conn: &Connection,
    fireball_id: FireballId,
    groups: &BTreeSet<GroupId>,
) -> StoreResult<()> {
    let fireball_text = fireball_id.to_string();
    conn.prepare_cached("DELETE FROM fireball_group_members WHERE fireball_uuid = ?1;")?
        .execute([fireball_text.as_str()])?;

    let mut insert = conn.prepare_cached(
        "INSERT INTO fireball_group_members (group_uuid, fireball_uuid)
         SELECT g.uuid, f.uuid
         FROM fireball_groups g, fireballs f
         WHERE g.uuid = ?1 AND f.uuid = ?2;",
    )?;
    for group_id in groups {
        insert.execute(params![group_id.to_string(), fireball_text.as_str()])?;
    }
    Ok(())
}

pub(crate) fn load_fireballs(conn: &Connection) -> StoreResult<Vec<Fireball>> {
    let mut memberships: BTreeMap<FireballId, BTreeSet<GroupId>> = BTreeMap::new();
    {
        let mut stmt =
            conn.prepare("SELECT group_uuid, fireball_uuid FROM fireball_group_members;")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let group_id = parse_uuid(&row.get::<_, String>(0)?, "group_uuid")?;
            let fireball_id = parse_uuid(&row.get::<_, String>(1)?, "fireball_uuid")?;
            memberships.entry(fireball_id).or_default().insert(group_id);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT
            uuid,
            occurred_at,
            latitude,
            longitude,
            altitude,
            velocity,
            radiated_energy,
            impact_energy
         FROM fireballs
         ORDER BY occurred_at DESC, uuid ASC;",
    )?;
    let mut rows = stmt.query([])?;
    let mut fireballs = Vec::new();
    while let Some(row) = rows.next()? {
        let mut fireball = parse_fireball_row(row)?;
        if let Some(groups) = memberships.remove(&fireball.id) {
            fireball.groups = groups;
        }
        fireballs.push(fireball);
    }
    Ok(fireballs)
}

pub(crate) fn load_groups(conn: &Connection) -> StoreResult<Vec<FireballGroup>> {
    let mut stmt =
        conn.prepare("SELECT uuid, name FROM fireball_groups ORDER BY name ASC, uuid ASC;")?;
    let mut rows = stmt.query([])?;
    let mut groups = Vec::new();
    while let Some(row) = rows.next()? {
        let group = FireballGroup {
            id: parse_uuid(&row.get::<_, String>("uuid")?, "fireball_groups.uuid")?,
            name: row.get("name")?,
        };
        group.validate()?;
        groups.push(group);
    }
    Ok(groups)
}

fn parse_fireball_row(row: &Row<'_>) -> StoreResult<Fireball> {
    let id = parse_uuid(&row.get::<_, String>("uuid")?, "fireballs.uuid")?;
    let occurred_at: i64 = row.get("occurred_at")?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(occurred_at).ok_or_else(|| {
        StoreError::InvalidData(format!(
            "invalid occurred_at value `{occurred_at}` in fireballs.occurred_at"
        ))
    })?;
    let fireball = Fireball::with_id(
        id,
        FireballData {
            timestamp,
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            altitude: row.get("altitude")?,
            velocity: row.get("velocity")?,
            radiated_energy: row.get("radiated_energy")?,
            impact_energy: row.get("impact_energy")?,
        },
    );
    fireball.validate()?;
    Ok(fireball)
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| StoreError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}
