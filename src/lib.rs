//! Roadmap Storage - step ordering and learner progress for career roadmaps
//!
//! A career is an ordered list of learning steps. Admins insert, move,
//! archive and remove steps; learners complete them and see each step as
//! completed, in progress, available, locked or disabled.
//!
//! ## Architecture
//!
//! - **Order manager**: keeps each career's orders exactly `1..=steps_count`
//!   under SQLite's per-row UNIQUE checking, using two-phase displacement
//! - **Progress tracker**: per-user progress records cached against the
//!   career's `order_epoch`, refreshed with optimistic version checks
//! - **Resource resolver**: read-time merge of career-global resources into
//!   a step's local lists
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/roadmap-storage/
//! ├── roadmap.db             # SQLite (WAL) with careers, steps, progress
//! └── config.toml            # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod services;

pub use config::Config;
pub use db::{Career, RoadmapDb, RoadmapStep, UserCareerProgress};
pub use error::{ErrorKind, StorageError};
pub use services::{
    CreateStepInput, EventBus, OrderManager, ProgressStatus, ProgressTracker, RoadmapService,
    Services, UpdateStepInput,
};
