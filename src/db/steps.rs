//! Roadmap step CRUD and order renumbering using Diesel
//!
//! Renumbering uses the displacement technique. SQLite checks the UNIQUE
//! `(career_id, order_index)` index row by row during an UPDATE, so a plain
//! `order_index = order_index + 1` over a range collides with the row that
//! has not moved yet. Instead the range is first lifted out of the valid
//! domain by `displacement` (strictly greater than any valid order), then
//! settled back so each row lands one slot away from where it started.
//!
//! Every function here must run inside the caller's transaction; none of
//! them leave the sequence gap-free on their own.

use diesel::prelude::*;

use super::diesel_schema::roadmap_steps;
use super::models::{current_timestamp, NewStep, RoadmapStep, StepRow};
use crate::error::StorageError;

/// Column updates for an existing step; `None` leaves a column untouched
#[derive(Debug, Default, AsChangeset)]
#[diesel(table_name = roadmap_steps)]
pub struct StepChangeset<'a> {
    pub title: Option<&'a str>,
    pub description: Option<Option<&'a str>>,
    pub courses_json: Option<&'a str>,
    pub playlists_json: Option<&'a str>,
    pub books_json: Option<&'a str>,
    pub allow_global_resources: Option<bool>,
    pub updated_at: Option<&'a str>,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get step by ID
pub fn get_step(conn: &mut SqliteConnection, step_id: &str) -> Result<Option<RoadmapStep>, StorageError> {
    roadmap_steps::table
        .filter(roadmap_steps::id.eq(step_id))
        .select(StepRow::as_select())
        .first(conn)
        .optional()
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .map(RoadmapStep::try_from)
        .transpose()
}

/// All steps of a career in ascending order
pub fn list_steps(conn: &mut SqliteConnection, career_id: &str) -> Result<Vec<RoadmapStep>, StorageError> {
    roadmap_steps::table
        .filter(roadmap_steps::career_id.eq(career_id))
        .order(roadmap_steps::order_index.asc())
        .select(StepRow::as_select())
        .load(conn)
        .map_err(|e| StorageError::Internal(format!("Steps query failed: {}", e)))?
        .into_iter()
        .map(RoadmapStep::try_from)
        .collect()
}

/// Order values of a career, ascending
pub fn list_orders(conn: &mut SqliteConnection, career_id: &str) -> Result<Vec<i32>, StorageError> {
    roadmap_steps::table
        .filter(roadmap_steps::career_id.eq(career_id))
        .order(roadmap_steps::order_index.asc())
        .select(roadmap_steps::order_index)
        .load(conn)
        .map_err(|e| StorageError::Internal(format!("Orders query failed: {}", e)))
}

/// Whether another step in the career already uses `title`
pub fn title_taken(
    conn: &mut SqliteConnection,
    career_id: &str,
    title: &str,
    excluding_step: Option<&str>,
) -> Result<bool, StorageError> {
    // Step ids are never empty, so "" excludes nothing
    roadmap_steps::table
        .filter(roadmap_steps::career_id.eq(career_id))
        .filter(roadmap_steps::title.eq(title))
        .filter(roadmap_steps::id.ne(excluding_step.unwrap_or("")))
        .count()
        .get_result::<i64>(conn)
        .map(|c| c > 0)
        .map_err(|e| StorageError::Internal(format!("Count query failed: {}", e)))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Insert a step row at an order slot that must already be free
pub fn insert_step(conn: &mut SqliteConnection, new_step: &NewStep<'_>) -> Result<(), StorageError> {
    diesel::insert_into(roadmap_steps::table)
        .values(new_step)
        .execute(conn)
        .map_err(|e| StorageError::from_write(e, "Step insert"))?;
    Ok(())
}

/// Apply non-order column changes
pub fn update_step(
    conn: &mut SqliteConnection,
    step_id: &str,
    changes: &StepChangeset<'_>,
) -> Result<(), StorageError> {
    let updated = diesel::update(roadmap_steps::table.filter(roadmap_steps::id.eq(step_id)))
        .set(changes)
        .execute(conn)
        .map_err(|e| StorageError::from_write(e, "Step update"))?;

    if updated == 0 {
        return Err(StorageError::NotFound(format!("Step {} not found", step_id)));
    }
    Ok(())
}

/// Set or clear the archive marker on a step
pub fn set_frozen(conn: &mut SqliteConnection, step_id: &str, frozen_by: Option<&str>) -> Result<(), StorageError> {
    let now = current_timestamp();
    let frozen_at = frozen_by.map(|_| now.clone());

    let updated = diesel::update(roadmap_steps::table.filter(roadmap_steps::id.eq(step_id)))
        .set((
            roadmap_steps::frozen_at.eq(frozen_at),
            roadmap_steps::frozen_by.eq(frozen_by),
            roadmap_steps::updated_at.eq(&now),
        ))
        .execute(conn)
        .map_err(|e| StorageError::Internal(format!("Step freeze update failed: {}", e)))?;

    if updated == 0 {
        return Err(StorageError::NotFound(format!("Step {} not found", step_id)));
    }
    Ok(())
}

/// Delete a step row, leaving a hole at its order
pub fn delete_step(conn: &mut SqliteConnection, step_id: &str) -> Result<bool, StorageError> {
    let deleted = diesel::delete(roadmap_steps::table.filter(roadmap_steps::id.eq(step_id)))
        .execute(conn)
        .map_err(|e| StorageError::Internal(format!("Delete failed: {}", e)))?;

    Ok(deleted > 0)
}

// ============================================================================
// Displacement Primitives
// ============================================================================

/// Phase 1: lift orders in `[lo, hi]` out of the valid domain by `displacement`
pub fn displace_range(
    conn: &mut SqliteConnection,
    career_id: &str,
    lo: i32,
    hi: i32,
    displacement: i32,
) -> Result<usize, StorageError> {
    diesel::update(
        roadmap_steps::table
            .filter(roadmap_steps::career_id.eq(career_id))
            .filter(roadmap_steps::order_index.ge(lo))
            .filter(roadmap_steps::order_index.le(hi)),
    )
    .set(roadmap_steps::order_index.eq(roadmap_steps::order_index + displacement))
    .execute(conn)
    .map_err(|e| StorageError::Internal(format!("Displacement failed: {}", e)))
}

/// Phase 2: bring every displaced row back, landing `delta` slots
/// (`+1` or `-1`) away from its original order.
pub fn settle_displaced(
    conn: &mut SqliteConnection,
    career_id: &str,
    displacement: i32,
    delta: i32,
) -> Result<usize, StorageError> {
    diesel::update(
        roadmap_steps::table
            .filter(roadmap_steps::career_id.eq(career_id))
            .filter(roadmap_steps::order_index.ge(displacement)),
    )
    .set(roadmap_steps::order_index.eq(roadmap_steps::order_index - (displacement - delta)))
    .execute(conn)
    .map_err(|e| StorageError::Internal(format!("Settle after displacement failed: {}", e)))
}

/// Write a single step's order; the target slot must be free
pub fn set_order(conn: &mut SqliteConnection, step_id: &str, order: i32) -> Result<(), StorageError> {
    diesel::update(roadmap_steps::table.filter(roadmap_steps::id.eq(step_id)))
        .set((
            roadmap_steps::order_index.eq(order),
            roadmap_steps::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| StorageError::Internal(format!("Order update failed: {}", e)))?;
    Ok(())
}

/// Free slot `at` in a career of `count` steps by shifting `[at, count]` up one
pub fn open_slot(
    conn: &mut SqliteConnection,
    career_id: &str,
    at: i32,
    count: i32,
    displacement: i32,
) -> Result<(), StorageError> {
    if at > count {
        return Ok(());
    }
    displace_range(conn, career_id, at, count, displacement)?;
    settle_displaced(conn, career_id, displacement, 1)?;
    Ok(())
}

/// Close the hole at `at` in a career whose highest order is `count`
pub fn close_slot(
    conn: &mut SqliteConnection,
    career_id: &str,
    at: i32,
    count: i32,
    displacement: i32,
) -> Result<(), StorageError> {
    if at >= count {
        return Ok(());
    }
    displace_range(conn, career_id, at + 1, count, displacement)?;
    settle_displaced(conn, career_id, displacement, -1)?;
    Ok(())
}

/// Move one step from `from` to `to`, rippling the steps in between by one
pub fn move_step(
    conn: &mut SqliteConnection,
    career_id: &str,
    step_id: &str,
    from: i32,
    to: i32,
    displacement: i32,
) -> Result<(), StorageError> {
    if from == to {
        return Ok(());
    }

    let (lo, hi, delta) = if to < from {
        (to, from - 1, 1)
    } else {
        (from + 1, to, -1)
    };

    displace_range(conn, career_id, lo, hi, displacement)?;
    set_order(conn, step_id, to)?;
    settle_displaced(conn, career_id, displacement, delta)?;
    Ok(())
}
