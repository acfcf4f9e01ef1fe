//! Progress tracker - per-user progression through a career roadmap
//!
//! A `UserCareerProgress` record is a cache of a view derived from the
//! roadmap. It remembers the career `order_epoch` it was derived at; when the
//! career's epoch moves on, the record is re-derived before use. Writes are
//! guarded by the record's `version` and retried a bounded number of times.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use diesel::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{careers, progress, steps, Career, RoadmapDb, RoadmapStep, UserCareerProgress};
use crate::error::StorageError;

use super::events::{EngineEvent, EventBus};

/// Status of one step relative to one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressStatus {
    Completed,
    InProgress,
    Available,
    LockedPrereq,
    DisabledFrozen,
}

// ============================================================================
// Derivation
// ============================================================================

/// Fields of a progress record that are recomputed from the roadmap
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedProgress {
    pub frontier_step: Option<String>,
    pub next_step: Option<String>,
    pub percentage_completed: f64,
}

/// Derive frontier, next step and percentage from the current roadmap.
///
/// Completed ids that no longer resolve to a step still count toward the
/// percentage (numerator and denominator alike) but never become the
/// frontier. Frozen steps are never `next_step`.
pub fn derive(steps: &[RoadmapStep], completed: &BTreeSet<String>) -> DerivedProgress {
    let frontier = steps
        .iter()
        .filter(|s| completed.contains(&s.id))
        .max_by_key(|s| s.order);
    let frontier_order = frontier.map(|s| s.order).unwrap_or(0);

    let next = steps
        .iter()
        .filter(|s| s.order > frontier_order)
        .filter(|s| !s.is_frozen() && !completed.contains(&s.id))
        .min_by_key(|s| s.order);

    DerivedProgress {
        frontier_step: frontier.map(|s| s.id.clone()),
        next_step: next.map(|s| s.id.clone()),
        percentage_completed: percentage(steps, completed),
    }
}

/// `|completed| / |active ∪ completed| * 100`
fn percentage(steps: &[RoadmapStep], completed: &BTreeSet<String>) -> f64 {
    let mut counted: HashSet<&str> = steps
        .iter()
        .filter(|s| !s.is_frozen())
        .map(|s| s.id.as_str())
        .collect();
    counted.extend(completed.iter().map(String::as_str));

    if counted.is_empty() {
        return 0.0;
    }
    (completed.len() as f64 / counted.len() as f64 * 100.0).clamp(0.0, 100.0)
}

/// Overwrite the derived fields of `record` and stamp it with `epoch`
pub fn apply_derivation(record: &mut UserCareerProgress, steps: &[RoadmapStep], epoch: i64) {
    let derived = derive(steps, &record.completed_steps);
    record.frontier_step = derived.frontier_step;
    record.next_step = derived.next_step;
    record.percentage_completed = derived.percentage_completed;
    record.order_epoch = epoch;
}

/// An unsaved record for a user engaging `career` for the first time
pub fn fresh_progress(user_id: &str, career: &Career, steps: &[RoadmapStep]) -> UserCareerProgress {
    let mut record = UserCareerProgress {
        id: String::new(),
        user_id: user_id.to_string(),
        career_id: career.id.clone(),
        completed_steps: BTreeSet::new(),
        in_progress_step: None,
        next_step: None,
        frontier_step: None,
        percentage_completed: 0.0,
        order_epoch: career.order_epoch,
        version: 0,
        created_at: String::new(),
        updated_at: String::new(),
    };
    apply_derivation(&mut record, steps, career.order_epoch);
    record
}

// ============================================================================
// Classification
// ============================================================================

/// Classification context for one user on one career, built once and
/// reused for every step of a roadmap render.
pub struct ProgressView<'a> {
    career: &'a Career,
    progress: &'a UserCareerProgress,
    frontier_order: Option<i32>,
    first_new_step: Option<&'a str>,
}

impl<'a> ProgressView<'a> {
    pub fn new(career: &'a Career, progress: &'a UserCareerProgress, steps: &'a [RoadmapStep]) -> Self {
        let frontier_order = progress
            .frontier_step
            .as_deref()
            .and_then(|id| steps.iter().find(|s| s.id == id))
            .map(|s| s.order);

        // Catch-up candidate: earliest open step behind the frontier
        let first_new_step = frontier_order.and_then(|frontier| {
            steps
                .iter()
                .filter(|s| s.order < frontier)
                .filter(|s| !s.is_frozen() && !progress.completed_steps.contains(&s.id))
                .min_by_key(|s| s.order)
                .map(|s| s.id.as_str())
        });

        Self {
            career,
            progress,
            frontier_order,
            first_new_step,
        }
    }

    pub fn classify(&self, step: &RoadmapStep) -> ProgressStatus {
        if self.career.is_frozen() || step.is_frozen() {
            return ProgressStatus::DisabledFrozen;
        }

        if self.progress.completed_steps.contains(&step.id) {
            return ProgressStatus::Completed;
        }

        if self.progress.next_step.as_deref() == Some(step.id.as_str()) {
            return self.actionable(step);
        }

        if let Some(frontier) = self.frontier_order {
            if step.order < frontier && self.first_new_step == Some(step.id.as_str()) {
                return self.actionable(step);
            }
        }

        ProgressStatus::LockedPrereq
    }

    fn actionable(&self, step: &RoadmapStep) -> ProgressStatus {
        if self.progress.in_progress_step.as_deref() == Some(step.id.as_str()) {
            ProgressStatus::InProgress
        } else {
            ProgressStatus::Available
        }
    }
}

/// Classify a single step; prefer `ProgressView` when classifying many
pub fn classify(
    step: &RoadmapStep,
    progress: &UserCareerProgress,
    career: &Career,
    steps: &[RoadmapStep],
) -> ProgressStatus {
    ProgressView::new(career, progress, steps).classify(step)
}

// ============================================================================
// Tracker Service
// ============================================================================

/// Consistent read of everything a progress write depends on
#[derive(Debug)]
pub struct ProgressContext {
    pub career: Career,
    pub steps: Vec<RoadmapStep>,
}

impl ProgressContext {
    fn step(&self, step_id: &str) -> Result<&RoadmapStep, StorageError> {
        self.steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))
    }
}

/// Result of one optimistic attempt
enum Attempt {
    Done(UserCareerProgress, bool, ProgressContext),
    Retry,
}

/// Owns per-user progress records
pub struct ProgressTracker {
    db: RoadmapDb,
    events: Arc<EventBus>,
    max_retries: u32,
}

impl ProgressTracker {
    pub fn new(db: RoadmapDb, events: Arc<EventBus>, max_retries: u32) -> Self {
        Self {
            db,
            events,
            max_retries,
        }
    }

    /// Return the user's progress on a career, re-derived if the career's
    /// ordering changed since it was last written. Created lazily.
    pub fn refresh_if_stale(&self, user_id: &str, career_id: &str) -> Result<UserCareerProgress, StorageError> {
        self.apply_with_retry(user_id, career_id, |_, _| Ok(false))
            .map(|(record, _)| record)
    }

    /// Refreshed progress together with the roadmap it was derived from
    pub fn snapshot(
        &self,
        user_id: &str,
        career_id: &str,
    ) -> Result<(ProgressContext, UserCareerProgress), StorageError> {
        self.apply_with_retry(user_id, career_id, |_, _| Ok(false))
            .map(|(record, ctx)| (ctx, record))
    }

    /// Mark an actionable step as the one the user is working on
    pub fn start_step(&self, user_id: &str, step_id: &str) -> Result<UserCareerProgress, StorageError> {
        let career_id = self.career_of(step_id)?;

        let (record, _) = self.apply_with_retry(user_id, &career_id, |ctx, record| {
            let step = ctx.step(step_id)?;
            match ProgressView::new(&ctx.career, record, &ctx.steps).classify(step) {
                ProgressStatus::InProgress => Ok(false),
                ProgressStatus::Completed => Err(StorageError::InvalidInput(format!(
                    "Step {} is already completed",
                    step_id
                ))),
                ProgressStatus::Available => {
                    record.in_progress_step = Some(step.id.clone());
                    Ok(true)
                }
                ProgressStatus::LockedPrereq => Err(StorageError::InvalidInput(format!(
                    "Step {} is locked behind earlier steps",
                    step_id
                ))),
                ProgressStatus::DisabledFrozen => {
                    Err(StorageError::NotFound(format!("Step {} is archived", step_id)))
                }
            }
        })?;

        self.events.emit(EngineEvent::StepStarted {
            user_id: user_id.to_string(),
            step_id: step_id.to_string(),
        });
        Ok(record)
    }

    /// Record completion of an actionable step
    pub fn complete_step(&self, user_id: &str, step_id: &str) -> Result<UserCareerProgress, StorageError> {
        let career_id = self.career_of(step_id)?;

        let (record, _) = self.apply_with_retry(user_id, &career_id, |ctx, record| {
            let step = ctx.step(step_id)?;
            let status = ProgressView::new(&ctx.career, record, &ctx.steps).classify(step);
            match status {
                ProgressStatus::Completed => Ok(false),
                ProgressStatus::Available | ProgressStatus::InProgress => {
                    record.completed_steps.insert(step.id.clone());
                    if record.in_progress_step.as_deref() == Some(step_id) {
                        record.in_progress_step = None;
                    }
                    apply_derivation(record, &ctx.steps, ctx.career.order_epoch);
                    Ok(true)
                }
                ProgressStatus::LockedPrereq => Err(StorageError::InvalidInput(format!(
                    "Step {} is locked behind earlier steps",
                    step_id
                ))),
                ProgressStatus::DisabledFrozen => {
                    Err(StorageError::NotFound(format!("Step {} is archived", step_id)))
                }
            }
        })?;

        info!(
            user = %user_id,
            step = %step_id,
            percentage = record.percentage_completed,
            "Step completed"
        );
        self.events.emit(EngineEvent::StepCompleted {
            user_id: user_id.to_string(),
            step_id: step_id.to_string(),
            percentage: record.percentage_completed,
        });
        Ok(record)
    }

    fn career_of(&self, step_id: &str) -> Result<String, StorageError> {
        self.db
            .with_conn(|conn| steps::get_step(conn, step_id))?
            .map(|s| s.career_id)
            .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))
    }

    /// Read-derive-write loop shared by every progress mutation.
    ///
    /// `mutate` edits the (already refreshed) record and reports whether it
    /// changed anything. The write only lands if the stored version still
    /// matches the version that was read.
    fn apply_with_retry<F>(
        &self,
        user_id: &str,
        career_id: &str,
        mutate: F,
    ) -> Result<(UserCareerProgress, ProgressContext), StorageError>
    where
        F: Fn(&ProgressContext, &mut UserCareerProgress) -> Result<bool, StorageError>,
    {
        for attempt in 0..=self.max_retries {
            let outcome = self.db.with_conn(|conn| {
                let (ctx, existing) = conn.transaction::<_, StorageError, _>(|conn| {
                    let ctx = load_context(conn, career_id)?;
                    let existing = progress::get_progress(conn, user_id, career_id)?;
                    Ok((ctx, existing))
                })?;

                let mut record = match &existing {
                    Some(record) => record.clone(),
                    None => fresh_progress(user_id, &ctx.career, &ctx.steps),
                };

                let mut refreshed = false;
                if record.is_stale(&ctx.career) && !ctx.career.is_frozen() {
                    apply_derivation(&mut record, &ctx.steps, ctx.career.order_epoch);
                    refreshed = true;
                }

                let mutated = mutate(&ctx, &mut record)?;

                match existing {
                    Some(_) if !(refreshed || mutated) => Ok(Attempt::Done(record, false, ctx)),
                    Some(_) => match progress::update_progress_if_version(conn, &record)? {
                        Some(stored) => Ok(Attempt::Done(stored, refreshed, ctx)),
                        None => Ok(Attempt::Retry),
                    },
                    None => match progress::insert_progress(conn, &record) {
                        Ok(stored) => Ok(Attempt::Done(stored, false, ctx)),
                        Err(StorageError::Conflict(_)) => Ok(Attempt::Retry),
                        Err(e) => Err(e),
                    },
                }
            })?;

            match outcome {
                Attempt::Done(record, refreshed, ctx) => {
                    if refreshed {
                        debug!(user = %user_id, career = %career_id, epoch = record.order_epoch, "Progress refreshed");
                        self.events.emit(EngineEvent::ProgressRefreshed {
                            user_id: user_id.to_string(),
                            career_id: career_id.to_string(),
                            epoch: record.order_epoch,
                        });
                    }
                    return Ok((record, ctx));
                }
                Attempt::Retry => {
                    debug!(user = %user_id, career = %career_id, attempt, "Progress version conflict, retrying");
                }
            }
        }

        warn!(user = %user_id, career = %career_id, "Progress write kept losing version checks");
        Err(StorageError::Conflict(format!(
            "Progress for user {} on career {} changed concurrently",
            user_id, career_id
        )))
    }
}

fn load_context(conn: &mut SqliteConnection, career_id: &str) -> Result<ProgressContext, StorageError> {
    let career = careers::get_career(conn, career_id)?
        .ok_or_else(|| StorageError::NotFound(format!("Career {} not found", career_id)))?;
    let steps = steps::list_steps(conn, career_id)?;
    Ok(ProgressContext { career, steps })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::Config;
    use crate::db::careers::CreateCareerInput;
    use crate::db::{FreezeMarker, ResourceLists};
    use crate::services::{CreateStepInput, Services};

    fn step(id: &str, order: i32) -> RoadmapStep {
        RoadmapStep {
            id: id.into(),
            career_id: "c1".into(),
            order,
            title: id.into(),
            description: None,
            resources: ResourceLists::default(),
            allow_global_resources: true,
            frozen: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn frozen(mut s: RoadmapStep) -> RoadmapStep {
        s.frozen = Some(FreezeMarker {
            at: "2026-01-01T00:00:00Z".into(),
            by: "admin".into(),
        });
        s
    }

    fn career(steps: i32) -> Career {
        Career {
            id: "c1".into(),
            title: "Career".into(),
            description: None,
            steps_count: steps,
            order_epoch: 0,
            resources: ResourceLists::default(),
            frozen: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn five() -> Vec<RoadmapStep> {
        (1..=5).map(|i| step(&format!("s{}", i), i)).collect()
    }

    fn progress_with(completed: &[&str], steps: &[RoadmapStep], c: &Career) -> UserCareerProgress {
        let mut record = fresh_progress("u1", c, steps);
        record.completed_steps = completed.iter().map(|s| s.to_string()).collect();
        apply_derivation(&mut record, steps, c.order_epoch);
        record
    }

    #[test]
    fn test_fresh_progress_points_at_first_step() {
        let steps = five();
        let c = career(5);
        let record = fresh_progress("u1", &c, &steps);
        assert_eq!(record.next_step.as_deref(), Some("s1"));
        assert_eq!(record.frontier_step, None);
        assert_eq!(record.percentage_completed, 0.0);
        assert_eq!(classify(&steps[0], &record, &c, &steps), ProgressStatus::Available);
        assert_eq!(classify(&steps[1], &record, &c, &steps), ProgressStatus::LockedPrereq);
    }

    #[test]
    fn test_catch_up_after_skip() {
        let steps = five();
        let c = career(5);
        let record = progress_with(&["s1", "s3"], &steps, &c);

        assert_eq!(record.frontier_step.as_deref(), Some("s3"));
        assert_eq!(record.next_step.as_deref(), Some("s4"));

        let view = ProgressView::new(&c, &record, &steps);
        assert_eq!(view.classify(&steps[0]), ProgressStatus::Completed);
        assert_eq!(view.classify(&steps[1]), ProgressStatus::Available);
        assert_eq!(view.classify(&steps[2]), ProgressStatus::Completed);
        assert_eq!(view.classify(&steps[3]), ProgressStatus::Available);
        assert_eq!(view.classify(&steps[4]), ProgressStatus::LockedPrereq);
    }

    #[test]
    fn test_only_first_gap_behind_frontier_is_open() {
        let steps = five();
        let c = career(5);
        let record = progress_with(&["s4"], &steps, &c);

        let view = ProgressView::new(&c, &record, &steps);
        assert_eq!(view.classify(&steps[0]), ProgressStatus::Available);
        assert_eq!(view.classify(&steps[1]), ProgressStatus::LockedPrereq);
        assert_eq!(view.classify(&steps[2]), ProgressStatus::LockedPrereq);
        assert_eq!(view.classify(&steps[4]), ProgressStatus::Available);
    }

    #[test]
    fn test_in_progress_marker() {
        let steps = five();
        let c = career(5);
        let mut record = progress_with(&["s1", "s3"], &steps, &c);
        record.in_progress_step = Some("s2".into());

        let view = ProgressView::new(&c, &record, &steps);
        assert_eq!(view.classify(&steps[1]), ProgressStatus::InProgress);
        assert_eq!(view.classify(&steps[3]), ProgressStatus::Available);
    }

    #[test]
    fn test_frozen_career_disables_everything() {
        let steps = five();
        let mut c = career(5);
        let record = progress_with(&["s1", "s2"], &steps, &c);
        c.frozen = Some(FreezeMarker {
            at: "2026-01-01T00:00:00Z".into(),
            by: "admin".into(),
        });

        for s in &steps {
            assert_eq!(classify(s, &record, &c, &steps), ProgressStatus::DisabledFrozen);
        }
    }

    #[test]
    fn test_frozen_step_skipped_as_next() {
        let mut steps = five();
        steps[1] = frozen(steps[1].clone());
        let c = career(5);
        let record = progress_with(&["s1"], &steps, &c);

        assert_eq!(record.next_step.as_deref(), Some("s3"));
        assert_eq!(classify(&steps[1], &record, &c, &steps), ProgressStatus::DisabledFrozen);
        // 1 of {s1, s3, s4, s5}
        assert_eq!(record.percentage_completed, 25.0);
    }

    #[test]
    fn test_percentage_counts_removed_completed_steps() {
        let steps = five();
        let mut completed: BTreeSet<String> = ["s1", "s2"].iter().map(|s| s.to_string()).collect();
        completed.insert("removed-step".into());

        let derived = derive(&steps, &completed);
        // 3 of {s1..s5, removed-step}
        assert_eq!(derived.percentage_completed, 50.0);
        assert_eq!(derived.frontier_step.as_deref(), Some("s2"));
        assert_eq!(derived.next_step.as_deref(), Some("s3"));
    }

    #[test]
    fn test_percentage_monotonic_when_completing() {
        let mut steps = five();
        steps[4] = frozen(steps[4].clone());
        let mut completed = BTreeSet::new();
        let mut last = derive(&steps, &completed).percentage_completed;

        for id in ["s2", "ghost", "s5", "s1", "s3", "s4"] {
            completed.insert(id.to_string());
            let now = derive(&steps, &completed).percentage_completed;
            assert!(now >= last, "{} dropped percentage {} -> {}", id, last, now);
            last = now;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_all_done_has_no_next() {
        let steps = five();
        let c = career(5);
        let record = progress_with(&["s1", "s2", "s3", "s4", "s5"], &steps, &c);
        assert_eq!(record.next_step, None);
        assert_eq!(record.frontier_step.as_deref(), Some("s5"));
        assert_eq!(record.percentage_completed, 100.0);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let steps = five();
        let c = career(5);
        let record = progress_with(&["s2"], &steps, &c);
        for s in &steps {
            assert_eq!(classify(s, &record, &c, &steps), classify(s, &record, &c, &steps));
        }
    }

    #[test]
    fn test_empty_career() {
        let c = career(0);
        let record = fresh_progress("u1", &c, &[]);
        assert_eq!(record.next_step, None);
        assert_eq!(record.percentage_completed, 0.0);
    }

    // ===== Version guard =====

    /// File-backed roadmap with one step; two pooled connections so a
    /// competing writer can land between a read and its write
    fn tracked_career(dir: &tempfile::TempDir, retries: u32) -> (RoadmapDb, ProgressTracker, String, String) {
        let db = RoadmapDb::open_path(&dir.path().join("roadmap.db"), 2, 1000).unwrap();
        let services = Services::new(db.clone(), &Config::default());
        let career = services
            .roadmap
            .create_career(CreateCareerInput {
                id: None,
                title: "Data Engineer".into(),
                description: None,
                resources: ResourceLists::default(),
            })
            .unwrap();
        let step_id = services
            .orders
            .create_step(CreateStepInput {
                career_id: career.id.clone(),
                title: "SQL".into(),
                description: None,
                order: None,
                resources: ResourceLists::default(),
                allow_global_resources: true,
            })
            .unwrap();
        let tracker = ProgressTracker::new(db.clone(), Arc::new(EventBus::new()), retries);
        tracker.refresh_if_stale("u1", &career.id).unwrap();
        (db, tracker, career.id, step_id)
    }

    /// Rewrite the stored record unchanged, moving its version on
    fn competing_write(db: &RoadmapDb, career_id: &str) {
        let current = db
            .with_conn(|conn| progress::get_progress(conn, "u1", career_id))
            .unwrap()
            .unwrap();
        let written = db
            .with_conn(|conn| progress::update_progress_if_version(conn, &current))
            .unwrap();
        assert!(written.is_some());
    }

    #[test]
    fn test_conflict_when_retries_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let (db, tracker, career_id, step_id) = tracked_career(&dir, 0);

        let err = tracker
            .apply_with_retry("u1", &career_id, |_, record| {
                competing_write(&db, &career_id);
                record.in_progress_step = Some(step_id.clone());
                Ok(true)
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // Only the competing write landed
        let stored = db
            .with_conn(|conn| progress::get_progress(conn, "u1", &career_id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.in_progress_step, None);
    }

    #[test]
    fn test_retry_rereads_after_lost_version() {
        let dir = tempfile::tempdir().unwrap();
        let (db, tracker, career_id, step_id) = tracked_career(&dir, 1);
        let first = Cell::new(true);
        let attempts = Cell::new(0);

        let (record, _) = tracker
            .apply_with_retry("u1", &career_id, |_, record| {
                attempts.set(attempts.get() + 1);
                if first.replace(false) {
                    competing_write(&db, &career_id);
                }
                record.in_progress_step = Some(step_id.clone());
                Ok(true)
            })
            .unwrap();

        assert_eq!(attempts.get(), 2);
        assert_eq!(record.version, 2);
        assert_eq!(record.in_progress_step.as_deref(), Some(step_id.as_str()));
    }
}
