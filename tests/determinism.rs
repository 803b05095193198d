//! Integration tests for deterministic dispatch order
//!
//! Identical trees fed identical resumptions must dispatch identical work
//! items, which the trace digest fingerprints.

mod common;

use common::{leaf, parallel, scripted_condition};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use trellis::activities::{If, WaitForBookmark, While};
use trellis::runtime::{
    Activity, ActivityExecutor, BookmarkScope, ExecutorConfig, Outcome, RunStatus,
};

fn approvals() -> Arc<Activity> {
    parallel(
        "approvals",
        vec![
            WaitForBookmark::new("legal").into_activity("wait-legal"),
            If::new(true)
                .then(leaf("notify"))
                .into_activity("maybe-notify"),
            WaitForBookmark::new("finance").into_activity("wait-finance"),
        ],
    )
}

fn run_with_resumptions(order: &[&str]) -> (String, Vec<(String, String)>, Option<Outcome>) {
    let mut exec = ActivityExecutor::new(ExecutorConfig::default());
    exec.start(approvals(), BTreeMap::new()).unwrap();
    exec.run_to_idle();
    for name in order {
        exec.resume_bookmark(name, &BookmarkScope::Workflow, json!(name));
        exec.run_to_idle();
    }
    let trace = exec.trace().unwrap();
    (trace.digest(), trace.steps(), exec.outcome().cloned())
}

#[test]
fn test_same_inputs_same_trace() {
    let first = run_with_resumptions(&["legal", "finance"]);
    let second = run_with_resumptions(&["legal", "finance"]);

    assert_eq!(first, second);
    assert_eq!(first.2, Some(Outcome::Completed(None)));
}

#[test]
fn test_resumption_order_changes_digest() {
    let legal_first = run_with_resumptions(&["legal", "finance"]);
    let finance_first = run_with_resumptions(&["finance", "legal"]);

    assert_eq!(legal_first.2, finance_first.2);
    assert_ne!(legal_first.0, finance_first.0);
}

#[test]
fn test_work_item_budget_does_not_change_order() {
    let workflow = || {
        While::new(scripted_condition("condition", &[true, true, true, false]))
            .body(leaf("body"))
            .into_activity("loop")
    };

    let mut unbounded = ActivityExecutor::new(ExecutorConfig::default());
    unbounded.start(workflow(), BTreeMap::new()).unwrap();
    assert!(unbounded.run_to_idle().is_completed());

    let mut stepped = ActivityExecutor::new(ExecutorConfig {
        max_work_items_per_pass: Some(1),
        ..ExecutorConfig::default()
    });
    stepped.start(workflow(), BTreeMap::new()).unwrap();
    let mut passes = 0;
    while stepped.run_to_idle() == RunStatus::Yielded {
        passes += 1;
    }

    assert!(passes > 1);
    assert_eq!(stepped.outcome(), unbounded.outcome());
    assert_eq!(
        stepped.trace().unwrap().digest(),
        unbounded.trace().unwrap().digest()
    );
}

#[test]
fn test_trace_disabled_still_completes() {
    let mut exec = ActivityExecutor::new(ExecutorConfig {
        record_trace: false,
        ..ExecutorConfig::default()
    });
    exec.start(leaf("only"), BTreeMap::new()).unwrap();

    assert!(exec.run_to_idle().is_completed());
    assert!(exec.trace().is_none());
    assert_eq!(exec.work_items_dispatched(), 1);
}
