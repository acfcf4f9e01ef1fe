//! Roadmap service - careers and the per-user read path
//!
//! Career lifecycle (create, archive, restore, global resources) plus the
//! render operations that combine ordering, progress and resource
//! inheritance into what a learner sees.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::db::careers::{self, CreateCareerInput};
use crate::db::{steps, Career, GlobalResource, ResourceLists, RoadmapDb, RoadmapStep, UserCareerProgress};
use crate::error::StorageError;

use super::events::{EngineEvent, EventBus};
use super::order_manager::{check_resource_lists, OrderReport, OrderManager};
use super::progress_tracker::{ProgressStatus, ProgressTracker, ProgressView};
use super::resource_resolver::{self, ResolvedResource};

/// Page size used when walking every career
const CAREER_PAGE: i64 = 200;

/// A step as rendered for one user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    #[serde(flatten)]
    pub step: RoadmapStep,
    pub effective_resources: ResourceLists<ResolvedResource>,
    pub status: ProgressStatus,
}

/// A whole roadmap as rendered for one user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapView {
    pub career: Career,
    pub progress: UserCareerProgress,
    pub steps: Vec<StepView>,
}

pub struct RoadmapService {
    db: RoadmapDb,
    events: Arc<EventBus>,
    orders: Arc<OrderManager>,
    progress: Arc<ProgressTracker>,
    max_resources: usize,
}

impl RoadmapService {
    pub fn new(
        db: RoadmapDb,
        events: Arc<EventBus>,
        orders: Arc<OrderManager>,
        progress: Arc<ProgressTracker>,
        max_resources: usize,
    ) -> Self {
        Self {
            db,
            events,
            orders,
            progress,
            max_resources,
        }
    }

    // ===== Read Operations =====

    pub fn get_career(&self, career_id: &str) -> Result<Career, StorageError> {
        self.db
            .with_conn(|conn| careers::get_career(conn, career_id))?
            .ok_or_else(|| StorageError::NotFound(format!("Career {} not found", career_id)))
    }

    pub fn list_careers(&self, limit: i64, offset: i64) -> Result<Vec<Career>, StorageError> {
        self.db.with_conn(|conn| careers::list_careers(conn, limit, offset))
    }

    // ===== Career Writes =====

    /// Create a career. Duplicate titles are a `Conflict`.
    pub fn create_career(&self, mut input: CreateCareerInput) -> Result<Career, StorageError> {
        input.title = input.title.trim().to_string();
        if input.title.is_empty() {
            return Err(StorageError::InvalidInput("Career title is required".into()));
        }
        check_resource_lists(&input.resources, self.max_resources)?;

        let career = self.db.write_tx(|conn| careers::create_career(conn, &input))?;

        info!(career = %career.id, title = %career.title, "Career created");
        self.events.emit(EngineEvent::CareerCreated {
            id: career.id.clone(),
            title: career.title.clone(),
        });
        Ok(career)
    }

    /// Replace a career's global resources. Ordering is unaffected.
    pub fn set_global_resources(
        &self,
        career_id: &str,
        resources: ResourceLists<GlobalResource>,
    ) -> Result<Career, StorageError> {
        check_resource_lists(&resources, self.max_resources)?;

        let career = self.db.write_tx(|conn| {
            careers::get_active_career(conn, career_id)?;
            careers::set_global_resources(conn, career_id, &resources)?;
            careers::get_career(conn, career_id)?
                .ok_or_else(|| StorageError::NotFound(format!("Career {} not found", career_id)))
        })?;

        debug!(career = %career_id, "Global resources replaced");
        Ok(career)
    }

    /// Freeze a career; every step renders `disabledFrozen` until restored.
    /// Archiving an archived career keeps the first marker.
    pub fn archive_career(&self, career_id: &str, actor: &str) -> Result<Career, StorageError> {
        if actor.trim().is_empty() {
            return Err(StorageError::InvalidInput("Archive actor is required".into()));
        }
        let (career, changed) = self.set_frozen(career_id, Some(actor))?;
        if !changed {
            return Ok(career);
        }

        info!(career = %career_id, by = %actor, "Career archived");
        self.events.emit(EngineEvent::CareerArchived {
            id: career_id.to_string(),
            by: actor.to_string(),
        });
        Ok(career)
    }

    pub fn restore_career(&self, career_id: &str) -> Result<Career, StorageError> {
        let (career, changed) = self.set_frozen(career_id, None)?;
        if !changed {
            return Ok(career);
        }

        info!(career = %career_id, "Career restored");
        self.events.emit(EngineEvent::CareerRestored {
            id: career_id.to_string(),
        });
        Ok(career)
    }

    /// The career after the write, and whether the freeze state changed
    fn set_frozen(
        &self,
        career_id: &str,
        frozen_by: Option<&str>,
    ) -> Result<(Career, bool), StorageError> {
        self.db.write_tx(|conn| {
            let load = |conn: &mut diesel::SqliteConnection| {
                careers::get_career(conn, career_id)?
                    .ok_or_else(|| StorageError::NotFound(format!("Career {} not found", career_id)))
            };
            let current = load(conn)?;
            if current.is_frozen() == frozen_by.is_some() {
                return Ok((current, false));
            }
            careers::set_frozen(conn, career_id, frozen_by)?;
            Ok((load(conn)?, true))
        })
    }

    // ===== Render =====

    /// One step with its effective resources and the user's status on it
    pub fn render_step(&self, step_id: &str, user_id: &str) -> Result<StepView, StorageError> {
        let career_id = self
            .db
            .with_conn(|conn| steps::get_step(conn, step_id))?
            .map(|s| s.career_id)
            .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))?;

        let (ctx, progress) = self.progress.snapshot(user_id, &career_id)?;
        let step = ctx
            .steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", step_id)))?;

        let view = ProgressView::new(&ctx.career, &progress, &ctx.steps);
        Ok(StepView {
            step: step.clone(),
            effective_resources: resource_resolver::resolve(step, &ctx.career),
            status: view.classify(step),
        })
    }

    /// Every step of a career in order, classified for `user_id`
    pub fn render_roadmap(&self, career_id: &str, user_id: &str) -> Result<RoadmapView, StorageError> {
        let (ctx, progress) = self.progress.snapshot(user_id, career_id)?;

        let steps = {
            let view = ProgressView::new(&ctx.career, &progress, &ctx.steps);
            ctx.steps
                .iter()
                .map(|step| StepView {
                    step: step.clone(),
                    effective_resources: resource_resolver::resolve(step, &ctx.career),
                    status: view.classify(step),
                })
                .collect()
        };

        Ok(RoadmapView {
            career: ctx.career,
            progress,
            steps,
        })
    }

    // ===== Maintenance =====

    /// Check the order invariant of every career
    pub fn verify_all(&self) -> Result<Vec<OrderReport>, StorageError> {
        let mut reports = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.list_careers(CAREER_PAGE, offset)?;
            if page.is_empty() {
                break;
            }
            for career in &page {
                reports.push(self.orders.verify_order(&career.id)?);
            }
            offset += page.len() as i64;
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{AppliesTo, Resource};
    use crate::services::order_manager::CreateStepInput;
    use crate::services::Services;

    fn services() -> Services {
        let db = RoadmapDb::open_in_memory().unwrap();
        Services::new(db, &Config::default())
    }

    fn career_input(title: &str) -> CreateCareerInput {
        CreateCareerInput {
            id: None,
            title: title.into(),
            description: None,
            resources: ResourceLists::default(),
        }
    }

    fn add_steps(services: &Services, career_id: &str, n: usize) -> Vec<String> {
        (1..=n)
            .map(|i| {
                services
                    .orders
                    .create_step(CreateStepInput {
                        career_id: career_id.into(),
                        title: format!("Step {}", i),
                        description: None,
                        order: None,
                        resources: ResourceLists::default(),
                        allow_global_resources: true,
                    })
                    .unwrap()
            })
            .collect()
    }

    fn statuses(view: &RoadmapView) -> Vec<ProgressStatus> {
        view.steps.iter().map(|s| s.status).collect()
    }

    #[test]
    fn test_render_fresh_roadmap() {
        let services = services();
        let career = services.roadmap.create_career(career_input("Data Engineer")).unwrap();
        add_steps(&services, &career.id, 3);

        let view = services.roadmap.render_roadmap(&career.id, "u1").unwrap();
        assert_eq!(
            statuses(&view),
            vec![
                ProgressStatus::Available,
                ProgressStatus::LockedPrereq,
                ProgressStatus::LockedPrereq
            ]
        );
        assert_eq!(view.progress.percentage_completed, 0.0);
        assert_eq!(view.progress.order_epoch, view.career.order_epoch);
    }

    #[test]
    fn test_archived_career_renders_disabled() {
        let services = services();
        let career = services.roadmap.create_career(career_input("Mobile")).unwrap();
        let ids = add_steps(&services, &career.id, 3);
        services.progress.complete_step("u1", &ids[0]).unwrap();

        services.roadmap.archive_career(&career.id, "admin").unwrap();
        let view = services.roadmap.render_roadmap(&career.id, "u1").unwrap();
        assert!(view.steps.iter().all(|s| s.status == ProgressStatus::DisabledFrozen));

        let err = services.progress.complete_step("u1", &ids[1]).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        services.roadmap.restore_career(&career.id).unwrap();
        let view = services.roadmap.render_roadmap(&career.id, "u1").unwrap();
        assert_eq!(view.steps[0].status, ProgressStatus::Completed);
        assert_eq!(view.steps[1].status, ProgressStatus::Available);
    }

    #[test]
    fn test_render_step_merges_globals() {
        let services = services();
        let mut input = career_input("Cloud");
        input.resources.courses.push(GlobalResource {
            title: "AWS Basics".into(),
            url: "https://aws.example".into(),
            applies_to: AppliesTo::All,
        });
        let career = services.roadmap.create_career(input).unwrap();

        let step_id = services
            .orders
            .create_step(CreateStepInput {
                career_id: career.id.clone(),
                title: "Compute".into(),
                description: None,
                order: None,
                resources: ResourceLists {
                    courses: vec![Resource {
                        title: "EC2 Deep Dive".into(),
                        url: "https://ec2.example".into(),
                    }],
                    playlists: Vec::new(),
                    books: Vec::new(),
                },
                allow_global_resources: true,
            })
            .unwrap();

        let view = services.roadmap.render_step(&step_id, "u1").unwrap();
        let titles: Vec<&str> = view
            .effective_resources
            .courses
            .iter()
            .map(|r| r.title.as_str())
            .collect();
        assert_eq!(titles, vec!["EC2 Deep Dive", "AWS Basics"]);
        assert_eq!(view.status, ProgressStatus::Available);
        // Stored lists stay local-only
        assert_eq!(view.step.resources.courses.len(), 1);
    }

    #[test]
    fn test_career_validation() {
        let services = services();
        let err = services.roadmap.create_career(career_input("  ")).unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));

        services.roadmap.create_career(career_input("SRE")).unwrap();
        let err = services.roadmap.create_career(career_input("SRE")).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let err = services.roadmap.archive_career("missing", "admin").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_verify_all_clean() {
        let services = services();
        let a = services.roadmap.create_career(career_input("A")).unwrap();
        let b = services.roadmap.create_career(career_input("B")).unwrap();
        add_steps(&services, &a.id, 3);
        add_steps(&services, &b.id, 2);

        let reports = services.roadmap.verify_all().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(OrderReport::is_valid));
    }

    #[test]
    fn test_archive_and_restore_are_idempotent() {
        let services = services();
        let career = services.roadmap.create_career(career_input("Security")).unwrap();
        let mut rx = services.events.subscribe();

        let archived = services.roadmap.archive_career(&career.id, "admin").unwrap();
        let again = services.roadmap.archive_career(&career.id, "someone-else").unwrap();
        assert_eq!(again.frozen, archived.frozen);
        assert_eq!(again.updated_at, archived.updated_at);
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::CareerArchived {
                id: career.id.clone(),
                by: "admin".into(),
            }
        );
        assert!(rx.try_recv().is_err());

        services.roadmap.restore_career(&career.id).unwrap();
        let restored = services.roadmap.restore_career(&career.id).unwrap();
        assert!(!restored.is_frozen());
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::CareerRestored { id: career.id.clone() });
        assert!(rx.try_recv().is_err());

        let err = services.roadmap.restore_career("missing").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_global_resources_need_title_and_url() {
        let services = services();
        let mut input = career_input("Frontend");
        input.resources.books.push(GlobalResource {
            title: "CSS".into(),
            url: "".into(),
            applies_to: AppliesTo::All,
        });
        let err = services.roadmap.create_career(input).unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));

        let career = services.roadmap.create_career(career_input("Frontend")).unwrap();
        let mut resources = ResourceLists::default();
        resources.playlists.push(GlobalResource {
            title: " ".into(),
            url: "https://css.example".into(),
            applies_to: AppliesTo::All,
        });
        let err = services.roadmap.set_global_resources(&career.id, resources).unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }

    #[test]
    fn test_career_input_from_json_without_resources() {
        let input: CreateCareerInput = serde_json::from_str(r#"{"title": "QA"}"#).unwrap();
        assert_eq!(input.resources, ResourceLists::default());
        let career = services().roadmap.create_career(input).unwrap();
        assert!(career.resources.courses.is_empty());
    }
}
