//! Integration tests for driving an executor from a tokio task

mod common;

use common::{ExternalCalls, external, parallel};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use trellis::activities::{FutureActivity, InvokeMethod, WaitForBookmark};
use trellis::runtime::{
    ActivityExecutor, BookmarkScope, ExecutorConfig, MethodRegistry, Outcome, ResumeResult,
    WorkflowHost,
};

fn executor_with(root: Arc<trellis::runtime::Activity>) -> ActivityExecutor {
    let mut exec = ActivityExecutor::new(ExecutorConfig::default());
    exec.start(root, BTreeMap::new()).unwrap();
    exec
}

#[tokio::test]
async fn test_resume_through_handle() {
    let host = WorkflowHost::spawn(executor_with(
        WaitForBookmark::new("approve").into_activity("wait"),
    ));
    let handle = host.handle();

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.is_suspended_on_bookmarks());

    let resumed = handle
        .resume_bookmark("approve", BookmarkScope::Workflow, json!({ "ok": true }))
        .await
        .unwrap();
    assert!(resumed.is_found());

    let outcome = handle.wait_for_outcome().await.unwrap();
    assert_eq!(outcome, Outcome::Completed(Some(json!({ "ok": true }))));

    let exec = host.join().await.unwrap();
    assert!(exec.instances().is_empty());
}

#[tokio::test]
async fn test_unknown_bookmark_through_handle() {
    let host = WorkflowHost::spawn(executor_with(
        WaitForBookmark::new("approve").into_activity("wait"),
    ));
    let handle = host.handle();

    let resumed = handle
        .resume_bookmark("reject", BookmarkScope::Workflow, Value::Null)
        .await
        .unwrap();
    assert_eq!(resumed, ResumeResult::NotFound);
    assert!(handle.outcome().is_none());

    handle.cancel().await.unwrap();
    assert_eq!(handle.wait_for_outcome().await.unwrap(), Outcome::Canceled);
}

#[tokio::test]
async fn test_completion_from_another_thread_wakes_host() {
    let calls = ExternalCalls::new();
    let host = WorkflowHost::spawn(executor_with(external("call", &calls)));
    let handle = host.handle();

    // The snapshot round-trip guarantees begin has run
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_operations.len(), 1);

    let token = calls.token();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        token.report_completion(Ok(json!("external")));
    });

    assert_eq!(
        handle.wait_for_outcome().await.unwrap(),
        Outcome::Completed(Some(json!("external")))
    );
}

#[tokio::test]
async fn test_abort_through_handle() {
    let stuck = ExternalCalls::new();
    let workflow = parallel(
        "work",
        vec![
            external("stuck", &stuck),
            WaitForBookmark::new("never").into_activity("wait"),
        ],
    );
    let host = WorkflowHost::spawn(executor_with(workflow));
    let handle = host.handle();

    handle.abort("operator request").await.unwrap();
    assert_eq!(handle.wait_for_outcome().await.unwrap(), Outcome::Canceled);

    let exec = host.join().await.unwrap();
    assert_eq!(exec.abort_reason(), Some("operator request"));
    assert_eq!(exec.pending_operation_count(), 0);
    assert!(exec.bookmarks().is_empty());
    assert_eq!(stuck.aborting_calls(), 1);
}

#[tokio::test]
async fn test_future_activity_under_host() {
    let delayed = FutureActivity::new(|args| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(json!(format!("hello {}", args["who"].as_str().unwrap_or("?"))))
    })
    .with_argument("who", json!("world"))
    .into_activity("greet");

    let host = WorkflowHost::spawn(executor_with(delayed));
    assert_eq!(
        host.handle().wait_for_outcome().await.unwrap(),
        Outcome::Completed(Some(json!("hello world")))
    );
}

#[tokio::test]
async fn test_blocking_method_under_host() {
    let mut registry = MethodRegistry::new(16);
    registry.register("math", "square", 1, |args| {
        let n = args[0].as_i64().unwrap_or_default();
        Ok(json!(n * n))
    });
    let square = InvokeMethod::new("math", "square")
        .parameter(json!(12))
        .run_asynchronously(true)
        .into_activity("square");

    let mut exec = ActivityExecutor::with_methods(ExecutorConfig::default(), Arc::new(registry));
    exec.start(square, BTreeMap::new()).unwrap();

    let host = WorkflowHost::spawn(exec);
    assert_eq!(
        host.handle().wait_for_outcome().await.unwrap(),
        Outcome::Completed(Some(json!(144)))
    );
}

#[tokio::test]
async fn test_host_stops_when_nothing_can_progress() {
    let host = WorkflowHost::spawn(executor_with(
        WaitForBookmark::new("orphan").into_activity("wait"),
    ));

    // Dropping every handle leaves nobody to resume the bookmark
    let exec = host.join().await.unwrap();
    assert!(exec.outcome().is_none());
    assert_eq!(exec.bookmarks().len(), 1);
}
