//! Career CRUD operations using Diesel

use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use super::diesel_schema::careers;
use super::models::{
    current_timestamp, Career, CareerRow, EncodedResources, GlobalResource, NewCareer, ResourceLists,
};
use crate::error::StorageError;

// ============================================================================
// Input Types
// ============================================================================

/// Input for creating a career
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCareerInput {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: ResourceLists<GlobalResource>,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get career by ID
pub fn get_career(conn: &mut SqliteConnection, career_id: &str) -> Result<Option<Career>, StorageError> {
    careers::table
        .filter(careers::id.eq(career_id))
        .select(CareerRow::as_select())
        .first(conn)
        .optional()
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .map(Career::try_from)
        .transpose()
}

/// Get a career that exists and is not frozen, or `NotFound`
pub fn get_active_career(conn: &mut SqliteConnection, career_id: &str) -> Result<Career, StorageError> {
    match get_career(conn, career_id)? {
        Some(career) if !career.is_frozen() => Ok(career),
        Some(_) => Err(StorageError::NotFound(format!("Career {} is archived", career_id))),
        None => Err(StorageError::NotFound(format!("Career {} not found", career_id))),
    }
}

/// List careers ordered by title
pub fn list_careers(
    conn: &mut SqliteConnection,
    limit: i64,
    offset: i64,
) -> Result<Vec<Career>, StorageError> {
    careers::table
        .order(careers::title.asc())
        .limit(limit)
        .offset(offset)
        .select(CareerRow::as_select())
        .load(conn)
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .into_iter()
        .map(Career::try_from)
        .collect()
}

// ============================================================================
// Write Operations
// ============================================================================

/// Create a career with no steps at epoch 0
pub fn create_career(conn: &mut SqliteConnection, input: &CreateCareerInput) -> Result<Career, StorageError> {
    let id = input
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = current_timestamp();
    let encoded = EncodedResources::encode(&input.resources)?;

    let new_career = NewCareer {
        id: &id,
        title: &input.title,
        description: input.description.as_deref(),
        steps_count: 0,
        order_epoch: 0,
        courses_json: &encoded.courses_json,
        playlists_json: &encoded.playlists_json,
        books_json: &encoded.books_json,
        created_at: &now,
        updated_at: &now,
    };

    diesel::insert_into(careers::table)
        .values(&new_career)
        .execute(conn)
        .map_err(|e| StorageError::from_write(e, "Career insert"))?;

    get_career(conn, &id)?
        .ok_or_else(|| StorageError::Internal(format!("Career {} vanished after insert", id)))
}

/// Replace the global resource lists of a career
pub fn set_global_resources(
    conn: &mut SqliteConnection,
    career_id: &str,
    resources: &ResourceLists<GlobalResource>,
) -> Result<(), StorageError> {
    let encoded = EncodedResources::encode(resources)?;
    let updated = diesel::update(careers::table.filter(careers::id.eq(career_id)))
        .set((
            careers::courses_json.eq(&encoded.courses_json),
            careers::playlists_json.eq(&encoded.playlists_json),
            careers::books_json.eq(&encoded.books_json),
            careers::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| StorageError::Internal(format!("Career update failed: {}", e)))?;

    expect_one(updated, career_id)
}

/// Adjust the materialized step count by `delta`
pub fn adjust_steps_count(conn: &mut SqliteConnection, career_id: &str, delta: i32) -> Result<(), StorageError> {
    let updated = diesel::update(careers::table.filter(careers::id.eq(career_id)))
        .set((
            careers::steps_count.eq(careers::steps_count + delta),
            careers::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| StorageError::Internal(format!("Step count update failed: {}", e)))?;

    expect_one(updated, career_id)
}

/// Increment the ordering epoch, returning the new value
pub fn bump_order_epoch(conn: &mut SqliteConnection, career_id: &str) -> Result<i64, StorageError> {
    let updated = diesel::update(careers::table.filter(careers::id.eq(career_id)))
        .set(careers::order_epoch.eq(careers::order_epoch + 1i64))
        .execute(conn)
        .map_err(|e| StorageError::Internal(format!("Epoch bump failed: {}", e)))?;
    expect_one(updated, career_id)?;

    careers::table
        .filter(careers::id.eq(career_id))
        .select(careers::order_epoch)
        .first(conn)
        .map_err(|e| StorageError::Internal(format!("Epoch read failed: {}", e)))
}

/// Set or clear the archive marker
pub fn set_frozen(
    conn: &mut SqliteConnection,
    career_id: &str,
    frozen_by: Option<&str>,
) -> Result<(), StorageError> {
    let now = current_timestamp();
    let frozen_at = frozen_by.map(|_| now.clone());

    let updated = diesel::update(careers::table.filter(careers::id.eq(career_id)))
        .set((
            careers::frozen_at.eq(frozen_at),
            careers::frozen_by.eq(frozen_by),
            careers::updated_at.eq(&now),
        ))
        .execute(conn)
        .map_err(|e| StorageError::Internal(format!("Career freeze update failed: {}", e)))?;

    expect_one(updated, career_id)
}

fn expect_one(updated: usize, career_id: &str) -> Result<(), StorageError> {
    if updated == 0 {
        return Err(StorageError::NotFound(format!("Career {} not found", career_id)));
    }
    Ok(())
}
