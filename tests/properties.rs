//! Property-based tests for executor invariants

mod common;

use common::{ExternalCalls, external, leaf, parallel, scripted_condition, started};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::collections::{BTreeSet, VecDeque};
use std::thread;
use trellis::activities::{WaitForBookmark, While};
use trellis::runtime::scheduler::{Scheduler, WorkAction};
use trellis::runtime::{BookmarkScope, InstanceId, LifecycleEvent, Outcome, RunStatus};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: however many threads race, exactly one completion is enqueued
    #[test]
    fn prop_concurrent_reports_complete_once(reporters in 1usize..8, cancel_first in any::<bool>()) {
        let calls = ExternalCalls::new();
        let (mut exec, recorder) = started(external("call", &calls));
        exec.run_to_idle();

        let token = calls.token();
        let handles: Vec<_> = (0..reporters)
            .map(|i| {
                let token = token.clone();
                thread::spawn(move || {
                    if cancel_first && i == 0 {
                        token.report_canceled()
                    } else {
                        token.report_completion(Ok(json!(i)))
                    }
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        prop_assert_eq!(winners, 1);
        prop_assert_eq!(exec.completion_inbox().len(), 1);
        prop_assert!(exec.run_to_idle().is_completed());
        prop_assert_eq!(calls.ends(), 1);
        prop_assert_eq!(
            recorder.count(|e| matches!(e, LifecycleEvent::OperationCompleted { .. })),
            1
        );
    }

    /// Property: normal-priority items leave the scheduler in arrival order
    #[test]
    fn prop_scheduler_is_fifo(ops in prop::collection::vec(any::<bool>(), 0..64)) {
        let mut scheduler = Scheduler::new();
        let mut model = VecDeque::new();
        let mut next = 0u64;

        for enqueue in ops {
            if enqueue {
                scheduler.enqueue(InstanceId(next), WorkAction::Start);
                model.push_back(next);
                next += 1;
            } else {
                let popped = scheduler.next_item().map(|item| item.instance.0);
                prop_assert_eq!(popped, model.pop_front());
            }
        }
        while let Some(item) = scheduler.next_item() {
            prop_assert_eq!(Some(item.instance.0), model.pop_front());
        }
        prop_assert!(model.is_empty());
    }

    /// Property: a loop with k true answers starts the condition k+1 times and
    /// leaves nothing behind
    #[test]
    fn prop_while_iterations(k in 0usize..12) {
        let mut answers = vec![true; k];
        answers.push(false);
        let workflow = While::new(scripted_condition("condition", &answers))
            .body(leaf("body"))
            .into_activity("loop");
        let (mut exec, recorder) = started(workflow);

        prop_assert_eq!(exec.run_to_idle(), RunStatus::Completed(Outcome::Completed(None)));
        let trace = exec.trace().unwrap();
        prop_assert_eq!(trace.starts_of("condition"), k + 1);
        prop_assert_eq!(trace.starts_of("body"), k);
        prop_assert!(exec.instances().is_empty());
        prop_assert_eq!(exec.pending_operation_count(), 0);
        prop_assert_eq!(
            recorder.count(|e| matches!(e, LifecycleEvent::InstanceStarted { .. })),
            recorder.count(|e| matches!(e, LifecycleEvent::InstanceCompleted { .. }))
        );
    }

    /// Property: each bookmark is found by its first resume only, and the
    /// tree finishes once every bookmark has been resumed
    #[test]
    fn prop_bookmarks_resume_once(resumes in prop::collection::vec(0usize..3, 0..12)) {
        let names = ["alpha", "beta", "gamma"];
        let workflow = parallel(
            "all",
            names
                .iter()
                .map(|name| WaitForBookmark::new(*name).into_activity(*name))
                .collect(),
        );
        let (mut exec, _recorder) = started(workflow);
        exec.run_to_idle();

        let mut resumed = BTreeSet::new();
        for index in resumes {
            let name = names[index];
            let found = exec
                .resume_bookmark(name, &BookmarkScope::Workflow, Value::Null)
                .is_found();
            prop_assert_eq!(found, resumed.insert(name));
            exec.run_to_idle();
        }

        prop_assert_eq!(exec.bookmarks().len(), names.len() - resumed.len());
        prop_assert_eq!(exec.outcome().is_some(), resumed.len() == names.len());
    }
}
