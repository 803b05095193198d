//! Integration tests for busy-count bookkeeping
//!
//! Every test runs with debug checks on, so any disagreement between an
//! instance's busy count and its outstanding work shows up as a
//! `BusyCountMismatch` event.

mod common;

use common::{ExternalCalls, external, leaf, parallel, started};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use trellis::activities::WaitForBookmark;
use trellis::runtime::{
    ActivityExecutor, BookmarkScope, ExecutorConfig, InstanceId, InstanceState, LifecycleEvent,
    RecordingObserver, RunStatus,
};

fn busy(exec: &ActivityExecutor, id: InstanceId) -> u32 {
    exec.instance(id).unwrap().busy_count()
}

fn mismatches(recorder: &RecordingObserver) -> usize {
    recorder.count(|e| matches!(e, LifecycleEvent::BusyCountMismatch { .. }))
}

#[test]
fn test_busy_count_follows_each_work_item() {
    let calls = ExternalCalls::new();
    let recorder = RecordingObserver::new();
    let mut exec = ActivityExecutor::new(ExecutorConfig {
        max_work_items_per_pass: Some(1),
        debug: true,
        ..ExecutorConfig::default()
    });
    exec.add_observer(recorder.clone());
    exec.start(parallel("group", vec![external("call", &calls)]), BTreeMap::new())
        .unwrap();
    let root = exec.root().unwrap();

    // Root start schedules the child but does not run it
    assert_eq!(exec.run_to_idle(), RunStatus::Yielded);
    let child = exec.instance(root).unwrap().children()[0];
    assert_eq!(busy(&exec, root), 1);
    assert_eq!(exec.instance(child).unwrap().state(), InstanceState::Created);
    assert_eq!(busy(&exec, child), 0);

    // Child start begins the operation
    assert_eq!(exec.run_to_idle(), RunStatus::Idle);
    assert_eq!(busy(&exec, root), 1);
    assert_eq!(busy(&exec, child), 1);
    assert_eq!(calls.begins(), 1);

    calls.token().report_completion(Ok(json!("done")));
    while exec.run_to_idle() == RunStatus::Yielded {}

    assert!(exec.outcome().is_some());
    assert_eq!(mismatches(&recorder), 0);
}

#[test]
fn test_busy_count_through_completion_abort_and_resume() {
    let first = ExternalCalls::new();
    let second = ExternalCalls::new();
    let workflow = parallel(
        "group",
        vec![
            external("first", &first),
            external("second", &second),
            WaitForBookmark::new("go").into_activity("wait"),
        ],
    );
    let (mut exec, recorder) = started(workflow);
    let root = exec.root().unwrap();

    assert_eq!(exec.run_to_idle(), RunStatus::Idle);
    let children = exec.instance(root).unwrap().children().to_vec();
    assert_eq!(busy(&exec, root), 3);
    assert_eq!(busy(&exec, children[0]), 1);
    assert_eq!(busy(&exec, children[1]), 1);
    assert_eq!(busy(&exec, children[2]), 0);

    first.token().report_completion(Ok(json!(1)));
    assert_eq!(exec.run_to_idle(), RunStatus::Idle);
    assert_eq!(busy(&exec, root), 2);

    // The aborted child stays counted until its completion is delivered
    exec.request_abort(children[1], "give up").unwrap();
    assert_eq!(
        recorder.count(|e| matches!(e, LifecycleEvent::OperationForceReleased { .. })),
        1
    );
    assert_eq!(busy(&exec, root), 2);
    assert_eq!(exec.run_to_idle(), RunStatus::Idle);
    assert_eq!(busy(&exec, root), 1);

    assert!(exec
        .resume_bookmark("go", &BookmarkScope::Workflow, Value::Null)
        .is_found());
    assert!(exec.run_to_idle().is_completed());
    assert!(exec.instances().is_empty());
    assert_eq!(mismatches(&recorder), 0);
}

#[test]
fn test_busy_count_with_many_synchronous_children() {
    let workflow = parallel("fan-out", (0..16).map(|i| leaf(&format!("leaf-{i}"))).collect());
    let (mut exec, recorder) = started(workflow);

    assert!(exec.run_to_idle().is_completed());
    assert!(recorder.count(|e| matches!(e, LifecycleEvent::WorkItemCompleted { .. })) > 16);
    assert_eq!(mismatches(&recorder), 0);
}
