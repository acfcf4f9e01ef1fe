//! User career progress persistence with optimistic version checks
//!
//! Writers read a record, derive the new state, then update with
//! `WHERE version = <read version>`. Zero affected rows means another
//! writer got there first; the service layer re-reads and retries.

use diesel::prelude::*;
use uuid::Uuid;

use super::diesel_schema::user_career_progress;
use super::models::{current_timestamp, NewProgress, ProgressRow, UserCareerProgress};
use crate::error::StorageError;

/// Get progress for a user+career pair
pub fn get_progress(
    conn: &mut SqliteConnection,
    user_id: &str,
    career_id: &str,
) -> Result<Option<UserCareerProgress>, StorageError> {
    user_career_progress::table
        .filter(user_career_progress::user_id.eq(user_id))
        .filter(user_career_progress::career_id.eq(career_id))
        .select(ProgressRow::as_select())
        .first(conn)
        .optional()
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .map(UserCareerProgress::try_from)
        .transpose()
}

/// Insert a new progress record at version 0.
///
/// Returns `Conflict` when a record for the pair already exists, which
/// happens when two first engagements race.
pub fn insert_progress(
    conn: &mut SqliteConnection,
    progress: &UserCareerProgress,
) -> Result<UserCareerProgress, StorageError> {
    let id = if progress.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        progress.id.clone()
    };
    let completed_json = serde_json::to_string(&progress.completed_steps)?;
    let now = current_timestamp();

    let new_progress = NewProgress {
        id: &id,
        user_id: &progress.user_id,
        career_id: &progress.career_id,
        completed_steps_json: &completed_json,
        in_progress_step: progress.in_progress_step.as_deref(),
        next_step: progress.next_step.as_deref(),
        frontier_step: progress.frontier_step.as_deref(),
        percentage_completed: progress.percentage_completed,
        order_epoch: progress.order_epoch,
        version: 0,
        created_at: &now,
        updated_at: &now,
    };

    diesel::insert_into(user_career_progress::table)
        .values(&new_progress)
        .execute(conn)
        .map_err(|e| StorageError::from_write(e, "Progress insert"))?;

    get_progress(conn, &progress.user_id, &progress.career_id)?
        .ok_or_else(|| StorageError::Internal(format!("Progress {} vanished after insert", id)))
}

/// Write `progress` if the stored version still equals `progress.version`.
///
/// Returns the stored record (version incremented) on success, `None` when
/// the version check lost.
pub fn update_progress_if_version(
    conn: &mut SqliteConnection,
    progress: &UserCareerProgress,
) -> Result<Option<UserCareerProgress>, StorageError> {
    let completed_json = serde_json::to_string(&progress.completed_steps)?;

    let updated = diesel::update(
        user_career_progress::table
            .filter(user_career_progress::id.eq(&progress.id))
            .filter(user_career_progress::version.eq(progress.version)),
    )
    .set((
        user_career_progress::completed_steps_json.eq(&completed_json),
        user_career_progress::in_progress_step.eq(progress.in_progress_step.as_deref()),
        user_career_progress::next_step.eq(progress.next_step.as_deref()),
        user_career_progress::frontier_step.eq(progress.frontier_step.as_deref()),
        user_career_progress::percentage_completed.eq(progress.percentage_completed),
        user_career_progress::order_epoch.eq(progress.order_epoch),
        user_career_progress::version.eq(progress.version + 1),
        user_career_progress::updated_at.eq(current_timestamp()),
    ))
    .execute(conn)
    .map_err(|e| StorageError::Internal(format!("Progress update failed: {}", e)))?;

    if updated == 0 {
        return Ok(None);
    }

    get_progress(conn, &progress.user_id, &progress.career_id)
}
