//! Diesel model definitions for database tables
//!
//! - `*Row` structs: SELECT results, JSON columns still encoded
//! - `New*` structs: INSERT payloads
//! - `Career`, `RoadmapStep`, `UserCareerProgress`: decoded domain records
//!   handed to the services

use std::collections::BTreeSet;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;
use crate::error::StorageError;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ============================================================================
// Resources
// ============================================================================

/// A learning resource attached directly to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub title: String,
    pub url: String,
}

/// Title and url shared by local and global resources
pub trait ResourceEntry {
    fn title(&self) -> &str;
    fn url(&self) -> &str;

    /// Missing title or url
    fn is_blank(&self) -> bool {
        self.title().trim().is_empty() || self.url().trim().is_empty()
    }
}

impl ResourceEntry for Resource {
    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Which steps a career-global resource is inherited by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "steps", rename_all = "camelCase")]
pub enum AppliesTo {
    All,
    Specific(BTreeSet<String>),
}

impl AppliesTo {
    pub fn includes(&self, step_id: &str) -> bool {
        match self {
            AppliesTo::All => true,
            AppliesTo::Specific(steps) => steps.contains(step_id),
        }
    }
}

/// A resource declared on the career and inherited by its steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalResource {
    pub title: String,
    pub url: String,
    pub applies_to: AppliesTo,
}

impl ResourceEntry for GlobalResource {
    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Resource categories, each merged independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceCategory {
    Courses,
    Playlists,
    Books,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 3] = [
        ResourceCategory::Courses,
        ResourceCategory::Playlists,
        ResourceCategory::Books,
    ];
}

impl std::fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceCategory::Courses => write!(f, "courses"),
            ResourceCategory::Playlists => write!(f, "playlists"),
            ResourceCategory::Books => write!(f, "books"),
        }
    }
}

/// The three resource lists carried by careers and steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "R: Deserialize<'de>"))]
pub struct ResourceLists<R> {
    #[serde(default)]
    pub courses: Vec<R>,
    #[serde(default)]
    pub playlists: Vec<R>,
    #[serde(default)]
    pub books: Vec<R>,
}

impl<R> Default for ResourceLists<R> {
    fn default() -> Self {
        Self {
            courses: Vec::new(),
            playlists: Vec::new(),
            books: Vec::new(),
        }
    }
}

impl<R> ResourceLists<R> {
    pub fn get(&self, category: ResourceCategory) -> &[R] {
        match category {
            ResourceCategory::Courses => &self.courses,
            ResourceCategory::Playlists => &self.playlists,
            ResourceCategory::Books => &self.books,
        }
    }

    pub fn get_mut(&mut self, category: ResourceCategory) -> &mut Vec<R> {
        match category {
            ResourceCategory::Courses => &mut self.courses,
            ResourceCategory::Playlists => &mut self.playlists,
            ResourceCategory::Books => &mut self.books,
        }
    }
}

impl<R: Serialize + for<'de> Deserialize<'de>> ResourceLists<R> {
    fn encode(&self) -> Result<(String, String, String), StorageError> {
        Ok((
            serde_json::to_string(&self.courses)?,
            serde_json::to_string(&self.playlists)?,
            serde_json::to_string(&self.books)?,
        ))
    }

    fn decode(courses: &str, playlists: &str, books: &str) -> Result<Self, StorageError> {
        Ok(Self {
            courses: serde_json::from_str(courses)?,
            playlists: serde_json::from_str(playlists)?,
            books: serde_json::from_str(books)?,
        })
    }
}

/// Archive marker: when and by whom a career or step was frozen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeMarker {
    pub at: String,
    pub by: String,
}

fn freeze_marker(at: Option<String>, by: Option<String>) -> Option<FreezeMarker> {
    at.map(|at| FreezeMarker {
        at,
        by: by.unwrap_or_default(),
    })
}

// ============================================================================
// Career Models
// ============================================================================

/// Career row from SELECT query
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = careers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CareerRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub steps_count: i32,
    pub order_epoch: i64,
    pub courses_json: String,
    pub playlists_json: String,
    pub books_json: String,
    pub frozen_at: Option<String>,
    pub frozen_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// New career for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = careers)]
pub struct NewCareer<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub steps_count: i32,
    pub order_epoch: i64,
    pub courses_json: &'a str,
    pub playlists_json: &'a str,
    pub books_json: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Decoded career
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Career {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub steps_count: i32,
    pub order_epoch: i64,
    pub resources: ResourceLists<GlobalResource>,
    pub frozen: Option<FreezeMarker>,
    pub created_at: String,
    pub updated_at: String,
}

impl Career {
    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }
}

impl TryFrom<CareerRow> for Career {
    type Error = StorageError;

    fn try_from(row: CareerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            resources: ResourceLists::decode(&row.courses_json, &row.playlists_json, &row.books_json)?,
            frozen: freeze_marker(row.frozen_at, row.frozen_by),
            id: row.id,
            title: row.title,
            description: row.description,
            steps_count: row.steps_count,
            order_epoch: row.order_epoch,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Encoded resource columns ready for INSERT/UPDATE
pub struct EncodedResources {
    pub courses_json: String,
    pub playlists_json: String,
    pub books_json: String,
}

impl EncodedResources {
    pub fn encode<R: Serialize + for<'de> Deserialize<'de>>(
        lists: &ResourceLists<R>,
    ) -> Result<Self, StorageError> {
        let (courses_json, playlists_json, books_json) = lists.encode()?;
        Ok(Self {
            courses_json,
            playlists_json,
            books_json,
        })
    }
}

// ============================================================================
// Step Models
// ============================================================================

/// Step row from SELECT query
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = roadmap_steps)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct StepRow {
    pub id: String,
    pub career_id: String,
    pub order_index: i32,
    pub title: String,
    pub description: Option<String>,
    pub courses_json: String,
    pub playlists_json: String,
    pub books_json: String,
    pub allow_global_resources: bool,
    pub frozen_at: Option<String>,
    pub frozen_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// New step for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = roadmap_steps)]
pub struct NewStep<'a> {
    pub id: &'a str,
    pub career_id: &'a str,
    pub order_index: i32,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub courses_json: &'a str,
    pub playlists_json: &'a str,
    pub books_json: &'a str,
    pub allow_global_resources: bool,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Decoded roadmap step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapStep {
    pub id: String,
    pub career_id: String,
    pub order: i32,
    pub title: String,
    pub description: Option<String>,
    pub resources: ResourceLists<Resource>,
    pub allow_global_resources: bool,
    pub frozen: Option<FreezeMarker>,
    pub created_at: String,
    pub updated_at: String,
}

impl RoadmapStep {
    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }
}

impl TryFrom<StepRow> for RoadmapStep {
    type Error = StorageError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Self {
            resources: ResourceLists::decode(&row.courses_json, &row.playlists_json, &row.books_json)?,
            frozen: freeze_marker(row.frozen_at, row.frozen_by),
            id: row.id,
            career_id: row.career_id,
            order: row.order_index,
            title: row.title,
            description: row.description,
            allow_global_resources: row.allow_global_resources,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ============================================================================
// Progress Models
// ============================================================================

/// Progress row from SELECT query
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = user_career_progress)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProgressRow {
    pub id: String,
    pub user_id: String,
    pub career_id: String,
    pub completed_steps_json: String,
    pub in_progress_step: Option<String>,
    pub next_step: Option<String>,
    pub frontier_step: Option<String>,
    pub percentage_completed: f64,
    pub order_epoch: i64,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// New progress record for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = user_career_progress)]
pub struct NewProgress<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub career_id: &'a str,
    pub completed_steps_json: &'a str,
    pub in_progress_step: Option<&'a str>,
    pub next_step: Option<&'a str>,
    pub frontier_step: Option<&'a str>,
    pub percentage_completed: f64,
    pub order_epoch: i64,
    pub version: i64,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Decoded per-user progress through one career
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCareerProgress {
    pub id: String,
    pub user_id: String,
    pub career_id: String,
    pub completed_steps: BTreeSet<String>,
    pub in_progress_step: Option<String>,
    pub next_step: Option<String>,
    pub frontier_step: Option<String>,
    pub percentage_completed: f64,
    pub order_epoch: i64,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl UserCareerProgress {
    /// Stale records must be refreshed before classification
    pub fn is_stale(&self, career: &Career) -> bool {
        self.order_epoch < career.order_epoch
    }
}

impl TryFrom<ProgressRow> for UserCareerProgress {
    type Error = StorageError;

    fn try_from(row: ProgressRow) -> Result<Self, Self::Error> {
        Ok(Self {
            completed_steps: serde_json::from_str(&row.completed_steps_json)?,
            id: row.id,
            user_id: row.user_id,
            career_id: row.career_id,
            in_progress_step: row.in_progress_step,
            next_step: row.next_step,
            frontier_step: row.frontier_step,
            percentage_completed: row.percentage_completed,
            order_epoch: row.order_epoch,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
