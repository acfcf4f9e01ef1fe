//! Integration tests for ordering, progress and rendering
//!
//! Run against on-disk databases in temp directories so the pool holds
//! several real connections, as in production.

use std::sync::Arc;
use std::thread;

use roadmap_storage::db::careers::CreateCareerInput;
use roadmap_storage::db::{steps, ResourceLists};
use roadmap_storage::services::{EngineEvent, RoadmapView};
use roadmap_storage::{
    Config, CreateStepInput, ErrorKind, ProgressStatus, RoadmapDb, Services, UpdateStepInput,
};
use tempfile::TempDir;

/// Helper to open services over a fresh database file
fn open_services() -> (Services, RoadmapDb, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    let db = RoadmapDb::open(&config).unwrap();
    let services = Services::new(db.clone(), &config);
    (services, db, temp_dir)
}

fn new_career(services: &Services, title: &str) -> String {
    services
        .roadmap
        .create_career(CreateCareerInput {
            id: None,
            title: title.into(),
            description: Some(format!("{} roadmap", title)),
            resources: ResourceLists::default(),
        })
        .unwrap()
        .id
}

fn step_input(career_id: &str, title: &str, order: Option<i32>) -> CreateStepInput {
    CreateStepInput {
        career_id: career_id.into(),
        title: title.into(),
        description: None,
        order,
        resources: ResourceLists::default(),
        allow_global_resources: true,
    }
}

fn add_steps(services: &Services, career_id: &str, titles: &[&str]) -> Vec<String> {
    titles
        .iter()
        .map(|t| services.orders.create_step(step_input(career_id, t, None)).unwrap())
        .collect()
}

fn titles(db: &RoadmapDb, career_id: &str) -> Vec<String> {
    db.with_conn(|conn| steps::list_steps(conn, career_id))
        .unwrap()
        .into_iter()
        .map(|s| s.title)
        .collect()
}

fn statuses(view: &RoadmapView) -> Vec<(String, ProgressStatus)> {
    view.steps
        .iter()
        .map(|s| (s.step.title.clone(), s.status))
        .collect()
}

fn assert_invariant(services: &Services, career_id: &str) {
    let report = services.orders.verify_order(career_id).unwrap();
    assert!(report.is_valid(), "order invariant broken: {:?}", report);
}

#[test]
fn test_insert_at_position_two() {
    let (services, db, _temp) = open_services();
    let career_id = new_career(&services, "Backend");
    add_steps(&services, &career_id, &["S1", "S2", "S3"]);

    services
        .orders
        .create_step(step_input(&career_id, "New", Some(2)))
        .unwrap();

    assert_eq!(titles(&db, &career_id), vec!["S1", "New", "S2", "S3"]);
    let career = services.roadmap.get_career(&career_id).unwrap();
    assert_eq!(career.steps_count, 4);
    assert_invariant(&services, &career_id);
}

#[test]
fn test_move_fourth_to_first() {
    let (services, db, _temp) = open_services();
    let career_id = new_career(&services, "Frontend");
    let ids = add_steps(&services, &career_id, &["S1", "S2", "S3", "S4"]);
    let epoch_before = services.roadmap.get_career(&career_id).unwrap().order_epoch;

    let moved = services.orders.move_step(&ids[3], 1).unwrap();

    assert_eq!(moved.order, 1);
    assert_eq!(titles(&db, &career_id), vec!["S4", "S1", "S2", "S3"]);
    assert_eq!(
        services.roadmap.get_career(&career_id).unwrap().order_epoch,
        epoch_before + 1
    );
    assert_invariant(&services, &career_id);
}

#[test]
fn test_insert_before_completed_step_reopens_catch_up() {
    let (services, _db, _temp) = open_services();
    let career_id = new_career(&services, "Security");
    let ids = add_steps(&services, &career_id, &["S1", "S2", "S3", "S4"]);

    services.progress.complete_step("learner", &ids[0]).unwrap();
    let before = services.progress.complete_step("learner", &ids[1]).unwrap();
    assert_eq!(before.percentage_completed, 50.0);

    // S1 N S2 S3 S4: completed orders {1, 3}
    services
        .orders
        .create_step(step_input(&career_id, "N", Some(2)))
        .unwrap();

    let view = services.roadmap.render_roadmap(&career_id, "learner").unwrap();
    assert_eq!(view.progress.order_epoch, view.career.order_epoch);
    assert_eq!(view.progress.frontier_step.as_deref(), Some(ids[1].as_str()));
    assert_eq!(view.progress.next_step.as_deref(), Some(ids[2].as_str()));
    assert_eq!(
        statuses(&view),
        vec![
            ("S1".to_string(), ProgressStatus::Completed),
            ("N".to_string(), ProgressStatus::Available),
            ("S2".to_string(), ProgressStatus::Completed),
            ("S3".to_string(), ProgressStatus::Available),
            ("S4".to_string(), ProgressStatus::LockedPrereq),
        ]
    );
    assert_eq!(view.progress.percentage_completed, 40.0);
}

#[test]
fn test_frozen_career_disables_every_step() {
    let (services, _db, _temp) = open_services();
    let career_id = new_career(&services, "Data");
    let ids = add_steps(&services, &career_id, &["S1", "S2", "S3"]);
    services.progress.complete_step("learner", &ids[0]).unwrap();

    services.roadmap.archive_career(&career_id, "admin").unwrap();

    let view = services.roadmap.render_roadmap(&career_id, "learner").unwrap();
    assert!(view
        .steps
        .iter()
        .all(|s| s.status == ProgressStatus::DisabledFrozen));

    let err = services
        .orders
        .create_step(step_input(&career_id, "Late", None))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_invariant_after_mixed_operations() {
    let (services, _db, _temp) = open_services();
    let career_id = new_career(&services, "Platform");
    let mut ids = add_steps(&services, &career_id, &["A", "B", "C"]);

    let id = services.orders.create_step(step_input(&career_id, "D", Some(1))).unwrap();
    ids.push(id);
    assert_invariant(&services, &career_id);

    services.orders.move_step(&ids[0], 4).unwrap();
    assert_invariant(&services, &career_id);

    let removed = ids.remove(1);
    services.orders.remove_step(&removed).unwrap();
    assert_invariant(&services, &career_id);

    let id = services.orders.create_step(step_input(&career_id, "E", Some(3))).unwrap();
    ids.push(id);
    assert_invariant(&services, &career_id);

    services.orders.move_step(&ids[ids.len() - 1], 1).unwrap();
    assert_invariant(&services, &career_id);

    let removed = ids.remove(0);
    services.orders.remove_step(&removed).unwrap();
    assert_invariant(&services, &career_id);

    services
        .orders
        .update_step(
            &ids[0],
            UpdateStepInput {
                title: Some("Renamed".into()),
                order: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
    assert_invariant(&services, &career_id);

    let career = services.roadmap.get_career(&career_id).unwrap();
    assert_eq!(career.steps_count as usize, ids.len());
}

#[test]
fn test_concurrent_inserts_keep_invariant() {
    let (services, _db, _temp) = open_services();
    let services = Arc::new(services);
    let career_id = new_career(&services, "Concurrency");

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let services = Arc::clone(&services);
            let career_id = career_id.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let order = if i % 2 == 0 { Some(1) } else { None };
                    services
                        .orders
                        .create_step(step_input(&career_id, &format!("T{}-{}", t, i), order))
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let career = services.roadmap.get_career(&career_id).unwrap();
    assert_eq!(career.steps_count, 40);
    assert_eq!(career.order_epoch, 40);
    assert_invariant(&services, &career_id);
}

#[test]
fn test_concurrent_completions_for_one_user() {
    let (services, _db, _temp) = open_services();
    let services = Arc::new(services);
    let career_id = new_career(&services, "Parallel");
    let ids = add_steps(&services, &career_id, &["S1", "S2", "S3", "S4"]);
    services.progress.complete_step("learner", &ids[0]).unwrap();
    services.progress.complete_step("learner", &ids[1]).unwrap();
    services
        .orders
        .create_step(step_input(&career_id, "N", Some(2)))
        .unwrap();

    // Both the catch-up step and S3 are actionable now
    let catch_up = services.roadmap.render_roadmap(&career_id, "learner").unwrap().steps[1]
        .step
        .id
        .clone();
    let targets = vec![catch_up, ids[2].clone()];

    let handles: Vec<_> = targets
        .clone()
        .into_iter()
        .map(|step_id| {
            let services = Arc::clone(&services);
            thread::spawn(move || services.progress.complete_step("learner", &step_id))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let progress = services.progress.refresh_if_stale("learner", &career_id).unwrap();
    for id in &targets {
        assert!(progress.completed_steps.contains(id));
    }
    assert_eq!(progress.completed_steps.len(), 4);
    assert_eq!(progress.next_step.as_deref(), Some(ids[3].as_str()));
}

#[test]
fn test_percentage_after_removals() {
    let (services, _db, _temp) = open_services();
    let career_id = new_career(&services, "Removal");
    let ids = add_steps(&services, &career_id, &["A", "B", "C", "D"]);
    services.progress.complete_step("learner", &ids[0]).unwrap();
    services.progress.complete_step("learner", &ids[1]).unwrap();

    // Completed-then-removed still counts on both sides: 2 of {A, B, C, D}
    services.orders.remove_step(&ids[1]).unwrap();
    let progress = services.progress.refresh_if_stale("learner", &career_id).unwrap();
    assert_eq!(progress.percentage_completed, 50.0);
    assert_eq!(progress.frontier_step.as_deref(), Some(ids[0].as_str()));
    assert_eq!(progress.next_step.as_deref(), Some(ids[2].as_str()));

    // Removed uncompleted steps drop out: 2 of {A, B, D}
    services.orders.remove_step(&ids[2]).unwrap();
    let progress = services.progress.refresh_if_stale("learner", &career_id).unwrap();
    assert!((progress.percentage_completed - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(progress.next_step.as_deref(), Some(ids[3].as_str()));
}

#[test]
fn test_archived_step_is_skipped() {
    let (services, _db, _temp) = open_services();
    let career_id = new_career(&services, "Archive");
    let ids = add_steps(&services, &career_id, &["A", "B", "C"]);
    services.progress.complete_step("learner", &ids[0]).unwrap();

    services.orders.archive_step(&ids[1], "admin").unwrap();
    let view = services.roadmap.render_roadmap(&career_id, "learner").unwrap();
    assert_eq!(
        statuses(&view),
        vec![
            ("A".to_string(), ProgressStatus::Completed),
            ("B".to_string(), ProgressStatus::DisabledFrozen),
            ("C".to_string(), ProgressStatus::Available),
        ]
    );
    assert_eq!(view.progress.percentage_completed, 50.0);

    let err = services.progress.complete_step("learner", &ids[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    services.orders.restore_step(&ids[1]).unwrap();
    let view = services.roadmap.render_roadmap(&career_id, "learner").unwrap();
    assert_eq!(view.steps[1].status, ProgressStatus::Available);
    assert_eq!(view.steps[2].status, ProgressStatus::LockedPrereq);
}

#[test]
fn test_error_kinds() {
    let (services, _db, _temp) = open_services();
    let career_id = new_career(&services, "Errors");
    let ids = add_steps(&services, &career_id, &["A", "B"]);

    let err = services
        .orders
        .create_step(step_input(&career_id, "A", None))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = services
        .orders
        .create_step(step_input(&career_id, "Far", Some(9)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let err = services.orders.move_step(&ids[0], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let err = services.orders.remove_step("no-such-step").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = services.progress.complete_step("learner", &ids[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let err = services.roadmap.render_step("no-such-step", "learner").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_start_then_complete() {
    let (services, _db, _temp) = open_services();
    let career_id = new_career(&services, "Start");
    let ids = add_steps(&services, &career_id, &["A", "B"]);

    let started = services.progress.start_step("learner", &ids[0]).unwrap();
    assert_eq!(started.in_progress_step.as_deref(), Some(ids[0].as_str()));
    let view = services.roadmap.render_step(&ids[0], "learner").unwrap();
    assert_eq!(view.status, ProgressStatus::InProgress);

    let done = services.progress.complete_step("learner", &ids[0]).unwrap();
    assert_eq!(done.in_progress_step, None);
    assert!(done.version > started.version);

    // Completing again is a no-op
    let again = services.progress.complete_step("learner", &ids[0]).unwrap();
    assert_eq!(again.version, done.version);
}

#[tokio::test]
async fn test_events_for_insert() {
    let (services, _db, _temp) = open_services();
    let mut receiver = services.events.subscribe();
    let career_id = new_career(&services, "Events");

    let step_id = services
        .orders
        .create_step(step_input(&career_id, "A", None))
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&EngineEvent::StepCreated {
        id: step_id,
        career_id: career_id.clone(),
        order: 1,
    }));
    assert!(seen.contains(&EngineEvent::OrderEpochBumped { career_id, epoch: 1 }));
}
