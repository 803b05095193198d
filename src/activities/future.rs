//! Async leaf backed by a future on the ambient tokio runtime

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::task::AbortHandle;

use crate::runtime::activity::{Activity, AsyncCodeActivity, InArgument, MetadataBuilder};
use crate::runtime::async_op::{AsyncResult, AsyncToken, OperationOutcome};
use crate::runtime::context::AsyncCodeActivityContext;
use crate::runtime::error::{ActivityResult, Fault};
use crate::runtime::ids::OperationId;

type FutureFactory =
    dyn Fn(BTreeMap<String, Value>) -> BoxFuture<'static, ActivityResult<Value>> + Send + Sync;

/// Spawns a future per execution and completes when it resolves
///
/// The future receives the resolved arguments. Cancellation aborts the task
/// and acknowledges the cancel; abort only aborts the task, since the
/// executor releases the operation itself.
pub struct FutureActivity {
    factory: Arc<FutureFactory>,
    arguments: Vec<(String, InArgument)>,
    tasks: Arc<Mutex<HashMap<OperationId, AbortHandle>>>,
}

impl FutureActivity {
    /// Build the future for each execution with `factory`
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(BTreeMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult<Value>> + Send + 'static,
    {
        Self {
            factory: Arc::new(move |args| -> BoxFuture<'static, ActivityResult<Value>> {
                Box::pin(factory(args))
            }),
            arguments: Vec::new(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind a required argument passed to the future
    pub fn with_argument(mut self, name: impl Into<String>, argument: impl Into<InArgument>) -> Self {
        self.arguments.push((name.into(), argument.into()));
        self
    }

    /// Finish into a shareable definition
    pub fn into_activity(self, name: impl Into<String>) -> Arc<Activity> {
        Activity::async_code(name, self)
    }

    /// Number of tasks still running
    ///
    /// A task drops out as soon as its future resolves, whether or not the
    /// executor ever runs `end` or `cancel` for it.
    pub fn running_tasks(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl AsyncCodeActivity for FutureActivity {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        for (name, argument) in &self.arguments {
            metadata.bind(name.clone(), Some(argument), true);
        }
    }

    fn begin(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        token: AsyncToken,
    ) -> ActivityResult<AsyncResult> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Fault::new(format!("'{}' needs a tokio runtime", ctx.activity_name())))?;

        let mut args = BTreeMap::new();
        for (name, _) in &self.arguments {
            args.insert(name.clone(), ctx.require_argument(name)?.clone());
        }

        let future = (self.factory)(args);
        let reporter = token.clone();
        let operation = token.operation();
        let tasks = self.tasks.clone();

        // Held across spawn and insert so the task's own removal comes after
        let mut running = self.tasks.lock();
        let task = runtime.spawn(async move {
            let result = future.await;
            tasks.lock().remove(&operation);
            reporter.report_completion(result);
        });
        running.insert(operation, task.abort_handle());
        Ok(token.pending())
    }

    fn end(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        outcome: OperationOutcome,
    ) -> ActivityResult<Option<Value>> {
        if let Some(token) = ctx.token() {
            self.tasks.lock().remove(&token.operation());
        }
        match outcome {
            OperationOutcome::Completed(value) => Ok(Some(value)),
            OperationOutcome::Failed(fault) => Err(fault),
            OperationOutcome::Canceled => Ok(None),
        }
    }

    fn cancel(&self, ctx: &mut AsyncCodeActivityContext<'_>) {
        let Some(token) = ctx.token() else {
            return;
        };
        if let Some(task) = self.tasks.lock().remove(&token.operation()) {
            task.abort();
        }
        if !ctx.is_aborting() {
            token.report_canceled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ActivityExecutor, ExecutorConfig, FaultKind, Outcome, RunStatus};
    use serde_json::json;
    use std::time::Duration;

    async fn drive(exec: &mut ActivityExecutor) -> RunStatus {
        let inbox = exec.completion_inbox();
        loop {
            match exec.run_to_idle() {
                RunStatus::Idle => inbox.notified().await,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_future_result_becomes_activity_result() {
        let add = FutureActivity::new(|args| async move {
            let n = args["n"].as_i64().unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!(n + 1))
        })
        .with_argument("n", json!(41))
        .into_activity("add-one");

        let mut exec = ActivityExecutor::new(ExecutorConfig::default());
        exec.start(add, BTreeMap::new()).unwrap();
        assert_eq!(
            drive(&mut exec).await,
            RunStatus::Completed(Outcome::Completed(Some(json!(42))))
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_task() {
        let forever = FutureActivity::new(|_args| async {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        })
        .into_activity("forever");

        let mut exec = ActivityExecutor::new(ExecutorConfig::default());
        exec.start(forever, BTreeMap::new()).unwrap();
        assert_eq!(exec.run_to_idle(), RunStatus::Idle);

        exec.cancel().unwrap();
        assert_eq!(drive(&mut exec).await, RunStatus::Completed(Outcome::Canceled));
    }

    #[test]
    fn test_requires_runtime() {
        let leaf = FutureActivity::new(|_args| async { Ok(Value::Null) }).into_activity("needs-tokio");
        let mut exec = ActivityExecutor::new(ExecutorConfig::default());
        exec.start(leaf, BTreeMap::new()).unwrap();

        let RunStatus::Completed(Outcome::Faulted(fault)) = exec.run_to_idle() else {
            panic!("expected a fault");
        };
        assert_eq!(fault.kind, FaultKind::User);
        assert!(fault.message.contains("tokio runtime"));
    }

    #[tokio::test]
    async fn test_finished_task_drops_out_before_end() {
        let quick = FutureActivity::new(|_args| async { Ok(json!("done")) });
        let tasks = quick.tasks.clone();

        let mut exec = ActivityExecutor::new(ExecutorConfig::default());
        exec.start(quick.into_activity("quick"), BTreeMap::new()).unwrap();
        assert_eq!(exec.run_to_idle(), RunStatus::Idle);
        assert_eq!(tasks.lock().len(), 1);

        exec.completion_inbox().notified().await;
        assert!(tasks.lock().is_empty());
        assert_eq!(
            drive(&mut exec).await,
            RunStatus::Completed(Outcome::Completed(Some(json!("done"))))
        );
    }

    #[tokio::test]
    async fn test_abort_after_resolution_leaves_no_task() {
        let quick = FutureActivity::new(|_args| async { Ok(json!("late")) });
        let tasks = quick.tasks.clone();

        let mut exec = ActivityExecutor::new(ExecutorConfig::default());
        exec.start(quick.into_activity("quick"), BTreeMap::new()).unwrap();
        assert_eq!(exec.run_to_idle(), RunStatus::Idle);

        // The result is claimed but never delivered to `end`
        exec.completion_inbox().notified().await;
        exec.abort("shutdown").unwrap();

        assert_eq!(exec.run_to_idle(), RunStatus::Completed(Outcome::Canceled));
        assert!(tasks.lock().is_empty());
    }
}
