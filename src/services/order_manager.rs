//! Order manager - creation, reordering and removal of roadmap steps
//!
//! Every operation that touches `order_index` runs under the career's
//! in-process lock and inside one `BEGIN IMMEDIATE` transaction, and bumps
//! the career's `order_epoch` so cached progress gets re-derived.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use diesel::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Config, MAX_STEPS_CEILING};
use crate::db::models::{current_timestamp, EncodedResources, NewStep};
use crate::db::steps::StepChangeset;
use crate::db::{
    careers, steps, Resource, ResourceCategory, ResourceEntry, ResourceLists, RoadmapDb, RoadmapStep,
};
use crate::error::StorageError;

use super::events::{EngineEvent, EventBus};

// ============================================================================
// Input Types
// ============================================================================

/// Input for creating a step
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStepInput {
    pub career_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 1-based slot; appended when omitted
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub resources: ResourceLists<Resource>,
    #[serde(default = "default_true")]
    pub allow_global_resources: bool,
}

fn default_true() -> bool {
    true
}

/// Partial update of a step. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStepInput {
    #[serde(default)]
    pub title: Option<String>,
    /// `Some(None)` clears the description
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub allow_global_resources: Option<bool>,
    /// Appended to the step's local lists
    #[serde(default)]
    pub add_resources: ResourceLists<Resource>,
    /// Titles removed from the step's local lists (applied before adds)
    #[serde(default)]
    pub remove_resources: ResourceLists<String>,
}

/// Distinguish an explicit `null` from an absent field
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Result of checking one career's orders against `{1..steps_count}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReport {
    pub career_id: String,
    pub steps_count: i32,
    pub row_count: usize,
    /// Expected orders with no step
    pub missing: Vec<i32>,
    /// Orders outside `1..=steps_count`
    pub unexpected: Vec<i32>,
}

impl OrderReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.row_count == self.steps_count as usize
    }
}

// ============================================================================
// Per-Career Locks
// ============================================================================

/// In-process write serialization, one mutex per career
#[derive(Default)]
pub struct CareerLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CareerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `career_id`, created on first use
    pub fn lock_for(&self, career_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(career_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// ============================================================================
// Order Manager
// ============================================================================

/// Owns step ordering for every career
pub struct OrderManager {
    db: RoadmapDb,
    events: Arc<EventBus>,
    locks: CareerLocks,
    max_steps: u32,
    max_resources: usize,
}

impl OrderManager {
    pub fn new(db: RoadmapDb, events: Arc<EventBus>, config: &Config) -> Self {
        Self {
            db,
            events,
            locks: CareerLocks::new(),
            max_steps: config.max_steps_per_career.min(MAX_STEPS_CEILING),
            max_resources: config.max_resources_per_list,
        }
    }

    /// Displacement constant for a career currently holding `steps_count`
    /// steps; strictly greater than any order the career can hold.
    pub fn displacement(&self, steps_count: i32) -> i32 {
        (self.max_steps as i32).max(steps_count) + 1
    }

    /// Run `f` in a write transaction while holding the career's lock
    fn locked<T, F>(&self, career_id: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError>,
    {
        let lock = self.locks.lock_for(career_id);
        // A panic under the lock cannot leave the store half-written
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.db.write_tx(f)
    }

    fn career_of(&self, step_id: &str) -> Result<String, StorageError> {
        self.db
            .with_conn(|conn| steps::get_step(conn, step_id))?
            .map(|s| s.career_id)
            .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))
    }

    fn check_lists<R: ResourceEntry>(&self, lists: &ResourceLists<R>) -> Result<(), StorageError> {
        check_resource_lists(lists, self.max_resources)
    }

    fn emit_epoch(&self, career_id: &str, epoch: i64) {
        self.events.emit(EngineEvent::OrderEpochBumped {
            career_id: career_id.to_string(),
            epoch,
        });
    }

    // ===== Insert =====

    /// Create a step at `input.order` (or at the end), shifting later steps
    /// down one slot. Returns the new step id.
    pub fn create_step(&self, input: CreateStepInput) -> Result<String, StorageError> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(StorageError::InvalidInput("Step title is required".into()));
        }
        self.check_lists(&input.resources)?;
        let encoded = EncodedResources::encode(&input.resources)?;
        let step_id = Uuid::new_v4().to_string();

        let (order, epoch) = self.locked(&input.career_id, |conn| {
            let career = careers::get_active_career(conn, &input.career_id)?;
            let count = career.steps_count;

            if count as u32 >= self.max_steps {
                return Err(StorageError::InvalidInput(format!(
                    "Career {} already has the maximum of {} steps",
                    career.id, self.max_steps
                )));
            }

            let order = input.order.unwrap_or(count + 1);
            if order < 1 || order > count + 1 {
                return Err(StorageError::InvalidInput(format!(
                    "Order {} out of range 1..={}",
                    order,
                    count + 1
                )));
            }

            if steps::title_taken(conn, &career.id, title, None)? {
                return Err(StorageError::Conflict(format!(
                    "Career {} already has a step titled '{}'",
                    career.id, title
                )));
            }

            steps::open_slot(conn, &career.id, order, count, self.displacement(count))?;

            let now = current_timestamp();
            steps::insert_step(
                conn,
                &NewStep {
                    id: &step_id,
                    career_id: &career.id,
                    order_index: order,
                    title,
                    description: input.description.as_deref(),
                    courses_json: &encoded.courses_json,
                    playlists_json: &encoded.playlists_json,
                    books_json: &encoded.books_json,
                    allow_global_resources: input.allow_global_resources,
                    created_at: &now,
                    updated_at: &now,
                },
            )?;

            careers::adjust_steps_count(conn, &career.id, 1)?;
            let epoch = careers::bump_order_epoch(conn, &career.id)?;
            Ok((order, epoch))
        })?;

        info!(step = %step_id, career = %input.career_id, order, epoch, "Step created");
        self.events.emit(EngineEvent::StepCreated {
            id: step_id.clone(),
            career_id: input.career_id.clone(),
            order,
        });
        self.emit_epoch(&input.career_id, epoch);

        Ok(step_id)
    }

    // ===== Update / Move =====

    /// Apply a partial update; an `order` different from the current one
    /// moves the step.
    pub fn update_step(&self, step_id: &str, patch: UpdateStepInput) -> Result<RoadmapStep, StorageError> {
        let career_id = self.career_of(step_id)?;

        let (step, changed, moved, epoch) = self.locked(&career_id, |conn| {
            let step = steps::get_step(conn, step_id)?
                .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))?;
            if step.is_frozen() {
                return Err(StorageError::NotFound(format!("Step {} is archived", step_id)));
            }
            let career = careers::get_active_career(conn, &step.career_id)?;

            // Validate everything before the first write
            let title = match patch.title.as_deref().map(str::trim) {
                Some("") => return Err(StorageError::InvalidInput("Step title is required".into())),
                Some(t) if t != step.title => {
                    if steps::title_taken(conn, &career.id, t, Some(&step.id))? {
                        return Err(StorageError::Conflict(format!(
                            "Career {} already has a step titled '{}'",
                            career.id, t
                        )));
                    }
                    Some(t)
                }
                _ => None,
            };

            let target = patch.order.filter(|o| *o != step.order);
            if let Some(to) = target {
                if to < 1 || to > career.steps_count {
                    return Err(StorageError::InvalidInput(format!(
                        "Order {} out of range 1..={}",
                        to, career.steps_count
                    )));
                }
            }

            let resources = edit_resources(&step.resources, &patch.remove_resources, &patch.add_resources);
            self.check_lists(&resources)?;
            let encoded = if resources != step.resources {
                Some(EncodedResources::encode(&resources)?)
            } else {
                None
            };

            let description = patch
                .description
                .as_ref()
                .map(|d| d.as_deref())
                .filter(|d| *d != step.description.as_deref());
            let allow_global_resources = patch
                .allow_global_resources
                .filter(|a| *a != step.allow_global_resources);

            let now = current_timestamp();
            let changes = StepChangeset {
                title,
                description,
                courses_json: encoded.as_ref().map(|e| e.courses_json.as_str()),
                playlists_json: encoded.as_ref().map(|e| e.playlists_json.as_str()),
                books_json: encoded.as_ref().map(|e| e.books_json.as_str()),
                allow_global_resources,
                updated_at: Some(now.as_str()),
            };
            let has_changes = changes.title.is_some()
                || changes.description.is_some()
                || encoded.is_some()
                || changes.allow_global_resources.is_some();
            if has_changes {
                steps::update_step(conn, &step.id, &changes)?;
            }

            let mut epoch = None;
            if let Some(to) = target {
                let displacement = self.displacement(career.steps_count);
                steps::move_step(conn, &career.id, &step.id, step.order, to, displacement)?;
                epoch = Some(careers::bump_order_epoch(conn, &career.id)?);
            }

            let updated = steps::get_step(conn, &step.id)?
                .ok_or_else(|| StorageError::Internal(format!("Step {} vanished during update", step.id)))?;
            let moved = target.map(|to| (step.order, to));
            if has_changes || moved.is_some() {
                debug!(step = %step.id, changed = has_changes, moved = moved.is_some(), "Step updated");
            }
            Ok((updated, has_changes, moved, epoch))
        })?;

        if changed {
            self.events.emit(EngineEvent::StepUpdated { id: step.id.clone() });
        }
        if let Some((from, to)) = moved {
            info!(step = %step.id, career = %career_id, from, to, "Step moved");
            self.events.emit(EngineEvent::StepMoved {
                id: step.id.clone(),
                career_id: career_id.clone(),
                from,
                to,
            });
        }
        if let Some(epoch) = epoch {
            self.emit_epoch(&career_id, epoch);
        }

        Ok(step)
    }

    /// Move a step to `new_order`; shorthand for an order-only update
    pub fn move_step(&self, step_id: &str, new_order: i32) -> Result<RoadmapStep, StorageError> {
        self.update_step(
            step_id,
            UpdateStepInput {
                order: Some(new_order),
                ..Default::default()
            },
        )
    }

    // ===== Remove =====

    /// Delete a step and close the gap it leaves
    pub fn remove_step(&self, step_id: &str) -> Result<(), StorageError> {
        let career_id = self.career_of(step_id)?;

        let (order, epoch) = self.locked(&career_id, |conn| {
            let step = steps::get_step(conn, step_id)?
                .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))?;
            let career = careers::get_active_career(conn, &step.career_id)?;

            if !steps::delete_step(conn, &step.id)? {
                return Err(StorageError::NotFound(format!("Step {} not found", step_id)));
            }
            let count = career.steps_count;
            steps::close_slot(conn, &career.id, step.order, count, self.displacement(count))?;
            careers::adjust_steps_count(conn, &career.id, -1)?;
            let epoch = careers::bump_order_epoch(conn, &career.id)?;
            Ok((step.order, epoch))
        })?;

        info!(step = %step_id, career = %career_id, order, epoch, "Step removed");
        self.events.emit(EngineEvent::StepRemoved {
            id: step_id.to_string(),
            career_id: career_id.clone(),
            order,
        });
        self.emit_epoch(&career_id, epoch);
        Ok(())
    }

    // ===== Archive / Restore =====

    /// Freeze a step in place. It keeps its slot but is skipped by progress.
    pub fn archive_step(&self, step_id: &str, actor: &str) -> Result<(), StorageError> {
        if actor.trim().is_empty() {
            return Err(StorageError::InvalidInput("Archive actor is required".into()));
        }
        let career_id = self.career_of(step_id)?;
        let epoch = self.set_step_frozen(&career_id, step_id, Some(actor))?;

        if let Some(epoch) = epoch {
            info!(step = %step_id, by = %actor, "Step archived");
            self.events.emit(EngineEvent::StepArchived {
                id: step_id.to_string(),
                by: actor.to_string(),
            });
            self.emit_epoch(&career_id, epoch);
        }
        Ok(())
    }

    /// Clear a step's archive marker
    pub fn restore_step(&self, step_id: &str) -> Result<(), StorageError> {
        let career_id = self.career_of(step_id)?;
        let epoch = self.set_step_frozen(&career_id, step_id, None)?;

        if let Some(epoch) = epoch {
            info!(step = %step_id, "Step restored");
            self.events.emit(EngineEvent::StepRestored { id: step_id.to_string() });
            self.emit_epoch(&career_id, epoch);
        }
        Ok(())
    }

    /// Returns the new epoch, or `None` when the marker already matched
    fn set_step_frozen(
        &self,
        career_id: &str,
        step_id: &str,
        frozen_by: Option<&str>,
    ) -> Result<Option<i64>, StorageError> {
        self.locked(career_id, |conn| {
            let step = steps::get_step(conn, step_id)?
                .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))?;
            careers::get_active_career(conn, &step.career_id)?;

            if step.is_frozen() == frozen_by.is_some() {
                return Ok(None);
            }
            steps::set_frozen(conn, &step.id, frozen_by)?;
            careers::bump_order_epoch(conn, &step.career_id).map(Some)
        })
    }

    // ===== Verification =====

    /// Compare a career's stored orders against `{1..steps_count}`
    pub fn verify_order(&self, career_id: &str) -> Result<OrderReport, StorageError> {
        self.db.with_conn(|conn| {
            conn.transaction::<_, StorageError, _>(|conn| {
                let career = careers::get_career(conn, career_id)?
                    .ok_or_else(|| StorageError::NotFound(format!("Career {} not found", career_id)))?;
                let orders = steps::list_orders(conn, career_id)?;
                Ok(order_report(&career.id, career.steps_count, &orders))
            })
        })
    }
}

/// Build the invariant report from ascending `orders`
pub fn order_report(career_id: &str, steps_count: i32, orders: &[i32]) -> OrderReport {
    let missing = (1..=steps_count)
        .filter(|o| orders.binary_search(o).is_err())
        .collect();
    let unexpected = orders
        .iter()
        .copied()
        .filter(|o| *o < 1 || *o > steps_count)
        .collect();

    OrderReport {
        career_id: career_id.to_string(),
        steps_count,
        row_count: orders.len(),
        missing,
        unexpected,
    }
}

/// Reject resource lists longer than `max` items
/// Every list within `max` items, every item with a title and a url
pub(crate) fn check_resource_lists<R: ResourceEntry>(
    lists: &ResourceLists<R>,
    max: usize,
) -> Result<(), StorageError> {
    for category in ResourceCategory::ALL {
        let list = lists.get(category);
        if list.len() > max {
            return Err(StorageError::InvalidInput(format!(
                "{} has {} items, at most {} allowed",
                category,
                list.len(),
                max
            )));
        }
        if list.iter().any(ResourceEntry::is_blank) {
            return Err(StorageError::InvalidInput(format!(
                "{} entries need a title and a url",
                category
            )));
        }
    }
    Ok(())
}

/// Local lists after removing titles in `remove` then appending `add`
fn edit_resources(
    current: &ResourceLists<Resource>,
    remove: &ResourceLists<String>,
    add: &ResourceLists<Resource>,
) -> ResourceLists<Resource> {
    let mut edited = current.clone();
    for category in ResourceCategory::ALL {
        let titles = remove.get(category);
        let list = edited.get_mut(category);
        list.retain(|r| !titles.contains(&r.title));
        list.extend(add.get(category).iter().cloned());
    }
    edited
}
