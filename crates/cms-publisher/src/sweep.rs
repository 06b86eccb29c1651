//! The publication sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::scheduler::SweepFn;
use crate::store::{PublicationStore, SweepTransaction};
use crate::types::{ProgramId, ProgramStatus, SweepReport};
use crate::SweepError;

/// Publishes every due scheduled lesson and cascades to its program.
///
/// A sweep is one transaction: either every claimed lesson and every
/// program promotion it implies is committed, or nothing is.
#[derive(Clone)]
pub struct PublicationSweep {
    store: Arc<dyn PublicationStore>,
    batch_limit: Option<u32>,
}

impl PublicationSweep {
    pub fn new(store: Arc<dyn PublicationStore>) -> Self {
        Self {
            store,
            batch_limit: None,
        }
    }

    /// Cap the number of lessons claimed per sweep. Lessons left over are
    /// picked up by later sweeps, oldest `publish_at` first.
    pub fn with_batch_limit(mut self, limit: Option<u32>) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn batch_limit(&self) -> Option<u32> {
        self.batch_limit
    }

    /// Run one sweep.
    #[tracing::instrument(skip(self), fields(batch_limit = ?self.batch_limit))]
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let now = tx.now();

        let mut report = match publish_claimed(tx.as_mut(), self.batch_limit).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed sweep also failed");
                }
                return Err(e);
            }
        };

        tx.commit().await?;

        report.now = Some(now);
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                lessons_published = report.lessons_published,
                programs_published = report.programs_published,
                elapsed_ms = report.elapsed_ms,
                "publication sweep committed"
            );
        } else {
            debug!(elapsed_ms = report.elapsed_ms, "no lessons due");
        }

        Ok(report)
    }

    /// Wrap this sweep for a [`SweepScheduler`](crate::SweepScheduler).
    pub fn into_sweep_fn(self) -> SweepFn {
        let sweep = Arc::new(self);
        Arc::new(move || {
            let sweep = Arc::clone(&sweep);
            Box::pin(async move { sweep.run().await })
        })
    }
}

async fn publish_claimed(
    tx: &mut dyn SweepTransaction,
    limit: Option<u32>,
) -> Result<SweepReport, SweepError> {
    let due = tx.claim_due_lessons(limit).await?;
    let mut report = SweepReport {
        claimed: due.len(),
        ..SweepReport::default()
    };
    let mut promoted: HashSet<ProgramId> = HashSet::new();

    for lesson in &due {
        tx.publish_lesson(lesson.lesson_id).await?;
        report.lessons_published += 1;
        debug!(
            lesson_id = %lesson.lesson_id,
            title = %lesson.title,
            publish_at = %lesson.publish_at,
            "lesson published"
        );

        if promoted.contains(&lesson.program_id) {
            continue;
        }

        match tx.program_status(lesson.program_id).await? {
            None => {
                return Err(SweepError::MissingProgram {
                    lesson_id: lesson.lesson_id,
                    program_id: lesson.program_id,
                });
            }
            Some(ProgramStatus::Published) => {}
            Some(_) => {
                if tx.publish_program(lesson.program_id).await? {
                    report.programs_published += 1;
                    info!(program_id = %lesson.program_id, "program published");
                }
            }
        }
        promoted.insert(lesson.program_id);
    }

    Ok(report)
}
