//! Property-based tests for the publication sweep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use cms_publisher::store::MemoryStore;
use cms_publisher::{
    CatalogStore, Clock, Lesson, LessonStatus, ManualClock, Program, ProgramId, ProgramStatus,
    PublicationSweep, Term,
};

#[derive(Debug, Clone)]
enum Seed {
    Draft,
    /// Scheduled this many seconds from now (negative is overdue).
    Scheduled(i64),
    Published,
}

fn lesson_seed() -> impl Strategy<Value = Seed> {
    prop_oneof![
        1 => Just(Seed::Draft),
        4 => (-3600i64..3600).prop_map(Seed::Scheduled),
        1 => Just(Seed::Published),
    ]
}

fn program_status() -> impl Strategy<Value = ProgramStatus> {
    prop_oneof![
        Just(ProgramStatus::Draft),
        Just(ProgramStatus::Published),
        Just(ProgramStatus::Archived),
    ]
}

/// Programs, each with a list of lessons in a single term.
fn catalog() -> impl Strategy<Value = Vec<(ProgramStatus, Vec<Seed>)>> {
    prop::collection::vec(
        (program_status(), prop::collection::vec(lesson_seed(), 0..8)),
        1..6,
    )
}

struct Outcome {
    before: Vec<Lesson>,
    after: HashMap<cms_publisher::LessonId, Lesson>,
    programs_before: HashMap<ProgramId, Program>,
    programs_after: HashMap<ProgramId, Program>,
    program_of: HashMap<cms_publisher::TermId, ProgramId>,
    now: chrono::DateTime<Utc>,
    second_claimed: usize,
    writes_after_first: usize,
    writes_after_second: usize,
}

fn run_sweeps(catalog: Vec<(ProgramStatus, Vec<Seed>)>) -> Outcome {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async move {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();
        let store = MemoryStore::new(clock.clone());
        let earlier = now - Duration::days(7);

        let mut before = Vec::new();
        let mut program_of = HashMap::new();
        for (i, (status, seeds)) in catalog.into_iter().enumerate() {
            let mut program = Program::new(format!("Program {}", i), "en");
            match status {
                ProgramStatus::Draft => {}
                ProgramStatus::Published => program = program.published(earlier),
                ProgramStatus::Archived => program = program.archived(),
            }
            let term = Term::new(program.id, 1, "Term");
            store.insert_program(&program).await.unwrap();
            store.insert_term(&term).await.unwrap();
            program_of.insert(term.id, program.id);

            for (n, seed) in seeds.into_iter().enumerate() {
                let lesson = Lesson::new(term.id, n as i32 + 1, format!("Lesson {}", n));
                let lesson = match seed {
                    Seed::Draft => lesson,
                    Seed::Scheduled(offset) => lesson.scheduled(now + Duration::seconds(offset)),
                    Seed::Published => lesson.published(earlier),
                };
                store.insert_lesson(&lesson).await.unwrap();
                before.push(lesson);
            }
        }
        let programs_before = store.programs().into_iter().map(|p| (p.id, p)).collect();

        let sweep = PublicationSweep::new(Arc::new(store.clone()));
        sweep.run().await.unwrap();
        let writes_after_first = store.sweep_writes();
        let second_claimed = sweep.run().await.unwrap().claimed;
        let writes_after_second = store.sweep_writes();

        Outcome {
            before,
            after: store.lessons().into_iter().map(|l| (l.id, l)).collect(),
            programs_before,
            programs_after: store.programs().into_iter().map(|p| (p.id, p)).collect(),
            program_of,
            now,
            second_claimed,
            writes_after_first,
            writes_after_second,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn due_lessons_publish_and_cascade(catalog in catalog()) {
        let out = run_sweeps(catalog);

        for lesson in out.before.iter().filter(|l| l.is_due(out.now)) {
            let after = &out.after[&lesson.id];
            prop_assert_eq!(after.status, LessonStatus::Published);
            prop_assert_eq!(after.published_at, Some(out.now));

            let program = &out.programs_after[&out.program_of[&lesson.term_id]];
            prop_assert_eq!(program.status, ProgramStatus::Published);
            prop_assert!(program.published_at.is_some());
        }
    }

    #[test]
    fn lessons_not_due_are_untouched(catalog in catalog()) {
        let out = run_sweeps(catalog);

        for lesson in out.before.iter().filter(|l| !l.is_due(out.now)) {
            prop_assert_eq!(&out.after[&lesson.id], lesson);
        }
    }

    #[test]
    fn second_sweep_writes_nothing(catalog in catalog()) {
        let out = run_sweeps(catalog);

        prop_assert_eq!(out.second_claimed, 0);
        prop_assert_eq!(out.writes_after_first, out.writes_after_second);
    }

    #[test]
    fn published_programs_are_never_rewritten(catalog in catalog()) {
        let out = run_sweeps(catalog);

        for (id, program) in &out.programs_before {
            if program.status == ProgramStatus::Published {
                prop_assert_eq!(&out.programs_after[id], program);
            }
        }
    }

    #[test]
    fn programs_without_due_lessons_keep_their_status(catalog in catalog()) {
        let out = run_sweeps(catalog);

        let promoted: Vec<ProgramId> = out
            .before
            .iter()
            .filter(|l| l.is_due(out.now))
            .map(|l| out.program_of[&l.term_id])
            .collect();
        for (id, program) in &out.programs_before {
            if !promoted.contains(id) {
                prop_assert_eq!(&out.programs_after[id], program);
            }
        }
    }
}
