//! FFI use-case API for Flutter-facing calls.
//!
//! # Responsibility
//! - Expose the collaborator interface of the sync core to Dart via FRB.
//! - Own the process-wide `SyncController` between `sync_init` and
//!   `sync_shutdown`.
//!
//! # Invariants
//! - Exported functions must not panic across the FFI boundary.
//! - Calls other than `sync_init` fail softly until init succeeded.
//! - Ids cross the boundary as UUID strings.

use fireball_core::{
    core_version as core_version_inner, init_logging as init_logging_inner, ping as ping_inner,
    Fireball, FireballGroup, FireballQuery, FireballSort, GroupId, ObjectRef, SyncConfig,
    SyncController,
};
use log::{info, warn};
use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

static CONTROLLER: Lazy<Mutex<Option<SyncController>>> = Lazy::new(|| Mutex::new(None));

/// Minimal health-check API for FRB smoke integration.
#[flutter_rust_bridge::frb(sync)]
pub fn ping() -> String {
    ping_inner().to_owned()
}

#[flutter_rust_bridge::frb(sync)]
pub fn core_version() -> String {
    core_version_inner().to_owned()
}

/// Initializes Rust core logging once per process.
///
/// Returns an empty string on success and the error message otherwise.
/// Repeating the call with the same `level + log_dir` is a no-op.
#[flutter_rust_bridge::frb(sync)]
pub fn init_logging(level: String, log_dir: String) -> String {
    match init_logging_inner(level.as_str(), log_dir.trim()) {
        Ok(()) => String::new(),
        Err(err) => err.to_string(),
    }
}

/// Fireball projection for list and map views.
#[derive(Debug, Clone, PartialEq)]
pub struct FireballItem {
    pub id: String,
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub velocity: f64,
    pub radiated_energy: f64,
    pub impact_energy: f64,
    /// 0..=8 scale used for color coding.
    pub magnitude: u8,
    pub group_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FireballListResponse {
    pub items: Vec<FireballItem>,
    /// Empty on success.
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupListResponse {
    pub items: Vec<GroupItem>,
    pub message: String,
}

/// Generic action response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResponse {
    pub ok: bool,
    /// Created object id, when the action creates one.
    pub id: Option<String>,
    /// Affected object count.
    pub affected: u32,
    pub message: String,
}

impl ActionResponse {
    fn success(affected: usize, id: Option<String>) -> Self {
        Self {
            ok: true,
            id,
            affected: u32::try_from(affected).unwrap_or(u32::MAX),
            message: String::new(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id: None,
            affected: 0,
            message: message.into(),
        }
    }
}

/// Opens the store under `data_dir` and starts the sync workers.
///
/// Returns an empty string on success. Calling it again while a controller
/// is running is a no-op.
#[flutter_rust_bridge::frb(sync)]
pub fn sync_init(data_dir: String) -> String {
    let data_dir = data_dir.trim();
    if data_dir.is_empty() {
        return "sync_init failed: data_dir cannot be empty".to_string();
    }
    let mut slot = lock_controller();
    if slot.is_some() {
        return String::new();
    }
    match SyncController::open(SyncConfig::for_data_dir(data_dir)) {
        Ok(controller) => {
            *slot = Some(controller);
            info!("event=ffi_sync_init module=ffi status=ok");
            String::new()
        }
        Err(err) => {
            warn!("event=ffi_sync_init module=ffi status=error error={}", err);
            format!("sync_init failed: {err}")
        }
    }
}

/// Stops workers and releases the store. Safe to call when not initialized.
#[flutter_rust_bridge::frb(sync)]
pub fn sync_shutdown() {
    if let Some(controller) = lock_controller().take() {
        controller.shutdown();
    }
}

/// Starts a fetch-and-ingest cycle in the background and returns at once.
#[flutter_rust_bridge::frb(sync)]
pub fn fetch_fireballs() -> String {
    with_controller(|controller| {
        controller.fetch_fireballs();
        Ok(())
    })
    .err()
    .unwrap_or_default()
}

/// Signals that another process wrote to the store file.
#[flutter_rust_bridge::frb(sync)]
pub fn process_remote_change() -> String {
    with_controller(|controller| {
        controller.process_remote_change();
        Ok(())
    })
    .err()
    .unwrap_or_default()
}

/// Lists fireballs.
///
/// `sort` is `newest|oldest|largest` (unknown values fall back to newest).
#[flutter_rust_bridge::frb(sync)]
pub fn list_fireballs(
    sort: String,
    group_id: Option<String>,
    min_magnitude: Option<u8>,
    limit: Option<u32>,
) -> FireballListResponse {
    let result = with_controller(|controller| {
        let group = match group_id.as_deref() {
            Some(raw) => Some(parse_id(raw)?),
            None => None,
        };
        let query = FireballQuery {
            sort: parse_sort(&sort),
            group,
            min_magnitude,
            limit: limit.map(|value| value as usize),
        };
        controller
            .fireballs(&query)
            .map_err(|err| format!("list_fireballs failed: {err}"))
    });
    match result {
        Ok(fireballs) => FireballListResponse {
            items: fireballs.iter().map(to_fireball_item).collect(),
            message: String::new(),
        },
        Err(message) => FireballListResponse {
            items: Vec::new(),
            message,
        },
    }
}

/// Lists groups sorted by name.
#[flutter_rust_bridge::frb(sync)]
pub fn list_groups() -> GroupListResponse {
    match with_controller(|controller| {
        controller
            .groups()
            .map_err(|err| format!("list_groups failed: {err}"))
    }) {
        Ok(groups) => GroupListResponse {
            items: groups.into_iter().map(to_group_item).collect(),
            message: String::new(),
        },
        Err(message) => GroupListResponse {
            items: Vec::new(),
            message,
        },
    }
}

#[flutter_rust_bridge::frb(sync)]
pub fn add_group(name: String) -> ActionResponse {
    match with_controller(|controller| {
        controller
            .add_group(&name)
            .map_err(|err| format!("add_group failed: {err}"))
    }) {
        Ok(id) => ActionResponse::success(1, Some(id.to_string())),
        Err(message) => ActionResponse::failure(message),
    }
}

#[flutter_rust_bridge::frb(sync)]
pub fn rename_group(group_id: String, name: String) -> ActionResponse {
    match with_controller(|controller| {
        let id = parse_id(&group_id)?;
        controller
            .rename_group(id, &name)
            .map_err(|err| format!("rename_group failed: {err}"))
    }) {
        Ok(true) => ActionResponse::success(1, Some(group_id.trim().to_string())),
        Ok(false) => ActionResponse::failure("rename_group failed: group not found"),
        Err(message) => ActionResponse::failure(message),
    }
}

/// Deletes the given fireballs and groups in one save.
#[flutter_rust_bridge::frb(sync)]
pub fn delete_objects(fireball_ids: Vec<String>, group_ids: Vec<String>) -> ActionResponse {
    match with_controller(|controller| {
        let mut objects = Vec::with_capacity(fireball_ids.len() + group_ids.len());
        for raw in &fireball_ids {
            objects.push(ObjectRef::Fireball(parse_id(raw)?));
        }
        for raw in &group_ids {
            objects.push(ObjectRef::Group(parse_id(raw)?));
        }
        controller
            .delete(&objects)
            .map_err(|err| format!("delete_objects failed: {err}"))
    }) {
        Ok(deleted) => ActionResponse::success(deleted, None),
        Err(message) => ActionResponse::failure(message),
    }
}

/// Replaces the group membership of one fireball.
#[flutter_rust_bridge::frb(sync)]
pub fn set_fireball_groups(fireball_id: String, group_ids: Vec<String>) -> ActionResponse {
    match with_controller(|controller| {
        let id = parse_id(&fireball_id)?;
        let groups = group_ids
            .iter()
            .map(|raw| parse_id(raw))
            .collect::<Result<BTreeSet<GroupId>, String>>()?;
        controller
            .set_fireball_groups(id, groups)
            .map_err(|err| format!("set_fireball_groups failed: {err}"))
    }) {
        Ok(true) => ActionResponse::success(1, None),
        Ok(false) => ActionResponse::failure("set_fireball_groups failed: fireball not found"),
        Err(message) => ActionResponse::failure(message),
    }
}

fn lock_controller() -> MutexGuard<'static, Option<SyncController>> {
    match CONTROLLER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn with_controller<T>(
    f: impl FnOnce(&SyncController) -> Result<T, String>,
) -> Result<T, String> {
    let slot = lock_controller();
    match slot.as_ref() {
        Some(controller) => f(controller),
        None => Err("sync is not initialized; call sync_init first".to_string()),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw.trim()).map_err(|err| format!("invalid id `{raw}`: {err}"))
}

fn parse_sort(raw: &str) -> FireballSort {
    match raw.trim().to_ascii_lowercase().as_str() {
        "oldest" => FireballSort::OldestFirst,
        "largest" => FireballSort::LargestImpactFirst,
        _ => FireballSort::NewestFirst,
    }
}

fn to_fireball_item(fireball: &Fireball) -> FireballItem {
    let data = &fireball.data;
    FireballItem {
        id: fireball.id.to_string(),
        timestamp_ms: data.timestamp.timestamp_millis(),
        latitude: data.latitude,
        longitude: data.longitude,
        altitude: data.altitude,
        velocity: data.velocity,
        radiated_energy: data.radiated_energy,
        impact_energy: data.impact_energy,
        magnitude: fireball.impact_energy_magnitude(),
        group_ids: fireball.groups.iter().map(Uuid::to_string).collect(),
    }
}

fn to_group_item(group: FireballGroup) -> GroupItem {
    GroupItem {
        id: group.id.to_string(),
        name: group.name,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        add_group, core_version, delete_objects, init_logging, list_fireballs, list_groups,
        parse_sort, ping, set_fireball_groups, sync_init, sync_shutdown,
    };
    use fireball_core::FireballSort;

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }

    #[test]
    fn init_logging_rejects_bad_input() {
        assert!(!init_logging("info".to_string(), String::new()).is_empty());
        assert!(!init_logging("verbose".to_string(), "/tmp/logs".to_string()).is_empty());
    }

    #[test]
    fn sort_names_map_to_query_sorts() {
        assert_eq!(parse_sort("Largest"), FireballSort::LargestImpactFirst);
        assert_eq!(parse_sort("oldest"), FireballSort::OldestFirst);
        assert_eq!(parse_sort("whatever"), FireballSort::NewestFirst);
    }

    #[test]
    fn sync_lifecycle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_init(String::new()).contains("empty"));
        assert_eq!(sync_init(dir.path().display().to_string()), "");

        let created = add_group("Perseids".to_string());
        assert!(created.ok, "{}", created.message);
        let group_id = created.id.clone().unwrap();
        assert!(!add_group(" ".to_string()).ok);

        let groups = list_groups();
        assert_eq!(groups.items.len(), 1);
        assert_eq!(groups.items[0].name, "Perseids");

        let listed = list_fireballs("newest".to_string(), Some(group_id.clone()), None, None);
        assert!(listed.message.is_empty(), "{}", listed.message);
        assert!(listed.items.is_empty());

        let missing = set_fireball_groups(uuid::Uuid::new_v4().to_string(), vec![group_id.clone()]);
        assert!(!missing.ok);
        assert!(!set_fireball_groups("not-a-uuid".to_string(), Vec::new()).ok);

        let deleted = delete_objects(Vec::new(), vec![group_id]);
        assert!(deleted.ok, "{}", deleted.message);
        assert_eq!(deleted.affected, 1);
        assert!(list_groups().items.is_empty());

        sync_shutdown();
        assert!(!list_groups().message.is_empty());
        sync_shutdown();
    }
}
