//! Publication sweep scenarios against the in-memory store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;

use cms_publisher::store::MemoryStore;
use cms_publisher::{
    CatalogStore, Clock, Lesson, LessonId, LessonStatus, ManualClock, Program, ProgramStatus,
    PublicationStore, PublicationSweep, SweepError, Term,
};

struct Fixture {
    clock: Arc<ManualClock>,
    store: MemoryStore,
    now: DateTime<Utc>,
}

impl Fixture {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();
        let store = MemoryStore::new(clock.clone());
        Self { clock, store, now }
    }

    fn sweep(&self) -> PublicationSweep {
        PublicationSweep::new(Arc::new(self.store.clone()))
    }

    async fn program(&self, program: Program) -> (Program, Term) {
        let term = Term::new(program.id, 1, "Term 1");
        self.store.insert_program(&program).await.unwrap();
        self.store.insert_term(&term).await.unwrap();
        (program, term)
    }

    async fn lesson(&self, lesson: Lesson) -> LessonId {
        self.store.insert_lesson(&lesson).await.unwrap();
        lesson.id
    }

    async fn lesson_state(&self, id: LessonId) -> Lesson {
        self.store.lesson(id).await.unwrap().unwrap()
    }

    async fn program_state(&self, program: &Program) -> Program {
        self.store.program(program.id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn due_lesson_publishes_lesson_and_program() {
    let fx = Fixture::new();
    let (program, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let a = fx
        .lesson(Lesson::new(term.id, 1, "A").scheduled(fx.now - Duration::seconds(10)))
        .await;

    let report = fx.sweep().run().await.unwrap();

    assert_eq!(report.claimed, 1);
    assert_eq!(report.lessons_published, 1);
    assert_eq!(report.programs_published, 1);
    assert_eq!(report.now, Some(fx.now));

    let lesson = fx.lesson_state(a).await;
    assert_eq!(lesson.status, LessonStatus::Published);
    assert_eq!(lesson.published_at, Some(fx.now));

    let program = fx.program_state(&program).await;
    assert_eq!(program.status, ProgramStatus::Published);
    assert_eq!(program.published_at, Some(fx.now));
}

#[tokio::test]
async fn future_lesson_is_untouched() {
    let fx = Fixture::new();
    let (program, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let b = fx
        .lesson(Lesson::new(term.id, 1, "B").scheduled(fx.now + Duration::seconds(60)))
        .await;
    let before = fx.lesson_state(b).await;

    let report = fx.sweep().run().await.unwrap();

    assert_eq!(report.claimed, 0);
    assert_eq!(fx.lesson_state(b).await, before);
    assert_eq!(fx.program_state(&program).await.status, ProgramStatus::Draft);
    assert_eq!(fx.store.sweep_writes(), 0);
}

#[tokio::test]
async fn lesson_due_exactly_now_is_published() {
    let fx = Fixture::new();
    let (_, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let id = fx.lesson(Lesson::new(term.id, 1, "Edge").scheduled(fx.now)).await;

    fx.sweep().run().await.unwrap();

    assert_eq!(fx.lesson_state(id).await.status, LessonStatus::Published);
}

#[tokio::test]
async fn future_lesson_publishes_once_clock_passes_it() {
    let fx = Fixture::new();
    let (_, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let id = fx
        .lesson(Lesson::new(term.id, 1, "Later").scheduled(fx.now + Duration::minutes(2)))
        .await;

    assert_eq!(fx.sweep().run().await.unwrap().claimed, 0);
    fx.clock.advance(Duration::minutes(2));
    assert_eq!(fx.sweep().run().await.unwrap().claimed, 1);

    let lesson = fx.lesson_state(id).await;
    assert_eq!(lesson.status, LessonStatus::Published);
    assert_eq!(lesson.published_at, Some(fx.now + Duration::minutes(2)));
}

#[tokio::test]
async fn sibling_lessons_promote_program_once() {
    let fx = Fixture::new();
    let (program, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let a = fx
        .lesson(Lesson::new(term.id, 1, "A").scheduled(fx.now - Duration::seconds(30)))
        .await;
    let c = fx
        .lesson(Lesson::new(term.id, 2, "C").scheduled(fx.now - Duration::seconds(5)))
        .await;

    let report = fx.sweep().run().await.unwrap();

    assert_eq!(report.lessons_published, 2);
    assert_eq!(report.programs_published, 1);
    // Two lesson rows plus a single program row.
    assert_eq!(fx.store.sweep_writes(), 3);
    assert_eq!(fx.lesson_state(a).await.status, LessonStatus::Published);
    assert_eq!(fx.lesson_state(c).await.status, LessonStatus::Published);
    assert_eq!(
        fx.program_state(&program).await.status,
        ProgramStatus::Published
    );
}

#[tokio::test]
async fn overlapping_transactions_publish_once() {
    let fx = Fixture::new();
    let (_, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let d = fx
        .lesson(Lesson::new(term.id, 1, "D").scheduled(fx.now - Duration::seconds(1)))
        .await;

    let mut first = fx.store.begin().await.unwrap();
    let mut second = fx.store.begin().await.unwrap();

    let first_claim = first.claim_due_lessons(None).await.unwrap();
    let second_claim = second.claim_due_lessons(None).await.unwrap();
    assert_eq!(first_claim.len(), 1);
    assert!(second_claim.is_empty());

    first.publish_lesson(d).await.unwrap();
    second.commit().await.unwrap();
    first.commit().await.unwrap();

    assert_eq!(fx.lesson_state(d).await.status, LessonStatus::Published);
    assert_eq!(fx.store.sweep_writes(), 1);

    // The lesson is no longer due for anyone.
    let mut third = fx.store.begin().await.unwrap();
    assert!(third.claim_due_lessons(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sweeps_publish_each_lesson_once() {
    let fx = Fixture::new();
    let (_, term) = fx.program(Program::new("Rust Basics", "en")).await;
    for n in 1..=20 {
        fx.lesson(
            Lesson::new(term.id, n, format!("Lesson {}", n))
                .scheduled(fx.now - Duration::seconds(i64::from(n))),
        )
        .await;
    }

    let sweeps: Vec<_> = (0..8)
        .map(|_| {
            let sweep = fx.sweep();
            tokio::spawn(async move { sweep.run().await })
        })
        .collect();

    let mut published = 0;
    for handle in sweeps {
        published += handle.await.unwrap().unwrap().lessons_published;
    }

    assert_eq!(published, 20);
    // Twenty lesson rows and one program row, however the claims interleaved.
    assert_eq!(fx.store.sweep_writes(), 21);
    assert!(
        fx.store
            .lessons()
            .iter()
            .all(|l| l.status == LessonStatus::Published)
    );
}

#[tokio::test]
async fn published_lesson_is_not_rewritten() {
    let fx = Fixture::new();
    let earlier = fx.now - Duration::days(3);
    let (program, term) = fx
        .program(Program::new("Rust Basics", "en").published(earlier))
        .await;
    let e = fx.lesson(Lesson::new(term.id, 1, "E").published(earlier)).await;

    let report = fx.sweep().run().await.unwrap();

    assert_eq!(report.claimed, 0);
    assert_eq!(fx.store.sweep_writes(), 0);
    assert_eq!(fx.lesson_state(e).await.published_at, Some(earlier));
    assert_eq!(fx.program_state(&program).await.published_at, Some(earlier));
}

#[tokio::test]
async fn published_program_keeps_its_timestamp() {
    let fx = Fixture::new();
    let earlier = fx.now - Duration::days(30);
    let (program, term) = fx
        .program(Program::new("Rust Basics", "en").published(earlier))
        .await;
    fx.lesson(Lesson::new(term.id, 1, "New").scheduled(fx.now - Duration::minutes(1)))
        .await;

    let report = fx.sweep().run().await.unwrap();

    assert_eq!(report.lessons_published, 1);
    assert_eq!(report.programs_published, 0);
    let program = fx.program_state(&program).await;
    assert_eq!(program.status, ProgramStatus::Published);
    assert_eq!(program.published_at, Some(earlier));
}

#[tokio::test]
async fn archived_program_is_promoted() {
    let fx = Fixture::new();
    let (program, term) = fx
        .program(Program::new("Rust Basics", "en").archived())
        .await;
    fx.lesson(Lesson::new(term.id, 1, "Revival").scheduled(fx.now))
        .await;

    fx.sweep().run().await.unwrap();

    let program = fx.program_state(&program).await;
    assert_eq!(program.status, ProgramStatus::Published);
    assert_eq!(program.published_at, Some(fx.now));
}

#[tokio::test]
async fn second_sweep_writes_nothing() {
    let fx = Fixture::new();
    let (_, term) = fx.program(Program::new("Rust Basics", "en")).await;
    fx.lesson(Lesson::new(term.id, 1, "A").scheduled(fx.now - Duration::seconds(10)))
        .await;

    fx.sweep().run().await.unwrap();
    let writes = fx.store.sweep_writes();

    let report = fx.sweep().run().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(fx.store.sweep_writes(), writes);
}

#[tokio::test]
async fn failed_publish_rolls_back_whole_sweep() {
    let fx = Fixture::new();
    let (first_program, first_term) = fx.program(Program::new("First", "en")).await;
    let (second_program, second_term) = fx.program(Program::new("Second", "fr")).await;
    let ok = fx
        .lesson(Lesson::new(first_term.id, 1, "Ok").scheduled(fx.now - Duration::minutes(5)))
        .await;
    let bad = fx
        .lesson(Lesson::new(second_term.id, 1, "Bad").scheduled(fx.now - Duration::minutes(1)))
        .await;
    fx.store.fail_on_publish(bad);

    let err = fx.sweep().run().await.unwrap_err();
    assert!(matches!(err, SweepError::Store(_)));

    assert_eq!(fx.lesson_state(ok).await.status, LessonStatus::Scheduled);
    assert_eq!(fx.lesson_state(bad).await.status, LessonStatus::Scheduled);
    assert_eq!(
        fx.program_state(&first_program).await.status,
        ProgramStatus::Draft
    );
    assert_eq!(
        fx.program_state(&second_program).await.status,
        ProgramStatus::Draft
    );
    assert_eq!(fx.store.sweep_writes(), 0);
    assert_eq!(fx.store.locked_rows(), 0);
}

#[tokio::test]
async fn missing_program_fails_sweep() {
    let fx = Fixture::new();
    // A term whose program row was never written.
    let orphan = Term::new(Program::new("Ghost", "en").id, 1, "Orphan");
    fx.store.insert_term(&orphan).await.unwrap();
    let lost = fx
        .lesson(Lesson::new(orphan.id, 1, "Lost").scheduled(fx.now - Duration::seconds(1)))
        .await;

    let err = fx.sweep().run().await.unwrap_err();
    match err {
        SweepError::MissingProgram {
            lesson_id,
            program_id,
        } => {
            assert_eq!(lesson_id, lost);
            assert_eq!(program_id, orphan.program_id);
        }
        other => panic!("expected MissingProgram, got {other:?}"),
    }
    assert_eq!(fx.lesson_state(lost).await.status, LessonStatus::Scheduled);
    assert_eq!(fx.store.locked_rows(), 0);
}

#[tokio::test]
async fn batch_limit_claims_oldest_first() {
    let fx = Fixture::new();
    let (_, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let oldest = fx
        .lesson(Lesson::new(term.id, 1, "Oldest").scheduled(fx.now - Duration::hours(3)))
        .await;
    let middle = fx
        .lesson(Lesson::new(term.id, 2, "Middle").scheduled(fx.now - Duration::hours(2)))
        .await;
    let newest = fx
        .lesson(Lesson::new(term.id, 3, "Newest").scheduled(fx.now - Duration::hours(1)))
        .await;

    let sweep = fx.sweep().with_batch_limit(Some(2));
    assert_eq!(sweep.batch_limit(), Some(2));

    let first = sweep.run().await.unwrap();
    assert_eq!(first.claimed, 2);
    assert_eq!(fx.lesson_state(oldest).await.status, LessonStatus::Published);
    assert_eq!(fx.lesson_state(middle).await.status, LessonStatus::Published);
    assert_eq!(fx.lesson_state(newest).await.status, LessonStatus::Scheduled);

    let second = sweep.run().await.unwrap();
    assert_eq!(second.claimed, 1);
    assert_eq!(second.programs_published, 0);
    assert_eq!(fx.lesson_state(newest).await.status, LessonStatus::Published);
}

#[tokio::test]
async fn manual_publish_then_sweep_leaves_program_alone() {
    let fx = Fixture::new();
    let (program, term) = fx.program(Program::new("Rust Basics", "en")).await;
    let manual = fx.lesson(Lesson::new(term.id, 1, "Manual")).await;
    fx.lesson(Lesson::new(term.id, 2, "Scheduled").scheduled(fx.now + Duration::minutes(1)))
        .await;

    fx.store
        .set_lesson_status(manual, cms_publisher::LessonStatusChange::PublishNow)
        .await
        .unwrap();
    let promoted_at = fx.program_state(&program).await.published_at;
    assert_eq!(promoted_at, Some(fx.now));

    fx.clock.advance(Duration::minutes(5));
    let report = fx.sweep().run().await.unwrap();

    assert_eq!(report.lessons_published, 1);
    assert_eq!(report.programs_published, 0);
    assert_eq!(fx.program_state(&program).await.published_at, promoted_at);
}
