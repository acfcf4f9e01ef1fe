//! Service layer for roadmap-storage
//!
//! Services hold the business rules between callers and repositories:
//! - Input validation before any write
//! - Per-career write serialization and transaction boundaries
//! - Progress derivation, epoch refresh and classification
//! - Event emission for audit/notifications
//!
//! ## Architecture
//!
//! ```text
//! Callers (HTTP layer, CLI)
//!     ↓
//! Service Layer (order manager, progress tracker, roadmap)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod order_manager;
pub mod progress_tracker;
pub mod resource_resolver;
pub mod response;
pub mod roadmap_service;

// Re-exports
pub use events::{spawn_listener, spawn_logging_listener, EngineEvent, EventBus, EventListener};
pub use order_manager::{CareerLocks, CreateStepInput, OrderManager, OrderReport, UpdateStepInput};
pub use progress_tracker::{classify, ProgressStatus, ProgressTracker, ProgressView};
pub use resource_resolver::ResolvedResource;
pub use roadmap_service::{RoadmapService, RoadmapView, StepView};

use std::sync::Arc;

use crate::config::Config;
use crate::db::RoadmapDb;

/// Service container for dependency injection
///
/// All services share one database pool and one event bus.
pub struct Services {
    pub orders: Arc<OrderManager>,
    pub progress: Arc<ProgressTracker>,
    pub roadmap: Arc<RoadmapService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services over a shared database
    pub fn new(db: RoadmapDb, config: &Config) -> Self {
        Self::with_events(db, config, Arc::new(EventBus::new()))
    }

    /// Create all services publishing to an existing event bus
    pub fn with_events(db: RoadmapDb, config: &Config, events: Arc<EventBus>) -> Self {
        let orders = Arc::new(OrderManager::new(db.clone(), events.clone(), config));
        let progress = Arc::new(ProgressTracker::new(
            db.clone(),
            events.clone(),
            config.progress_refresh_retries,
        ));
        let roadmap = Arc::new(RoadmapService::new(
            db,
            events.clone(),
            orders.clone(),
            progress.clone(),
            config.max_resources_per_list,
        ));

        Self {
            orders,
            progress,
            roadmap,
            events,
        }
    }
}
