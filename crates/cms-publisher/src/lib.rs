//! Scheduled publication for the course CMS.
//!
//! This crate promotes lessons from `scheduled` to `published` once their
//! `publish_at` has passed, cascading the promotion to the owning program:
//! - A [`PublicationSweep`] claims due lessons with skip-locked selection and
//!   publishes them inside a single transaction
//! - A [`SweepScheduler`] runs one sweep at startup and then one per interval,
//!   never overlapping and never dying on a failed sweep
//! - Store backends for SQLite, Postgres (feature `postgres`) and memory

pub mod clock;
mod error;
mod scheduler;
pub mod store;
mod sweep;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, SweepError};
pub use scheduler::{DEFAULT_INTERVAL, SchedulerHandle, SchedulerStats, SweepFn, SweepScheduler};
pub use store::{CatalogStore, Database, PublicationStore, SweepTransaction};
pub use sweep::PublicationSweep;
pub use types::{
    DueLesson, Lesson, LessonId, LessonStatus, LessonStatusChange, Program, ProgramId,
    ProgramStatus, SweepReport, Term, TermId,
};
