//! Shared activities for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trellis::activities::CodeFn;
use trellis::runtime::{
    Activity, ActivityExecutor, ActivityResult, AsyncCodeActivity, AsyncCodeActivityContext,
    AsyncResult, AsyncToken, ExecutorConfig, MetadataBuilder, NativeActivity,
    NativeActivityContext, OperationOutcome, RecordingObserver,
};

/// Schedules every branch at once and closes when all have finished
pub struct Parallel {
    branches: Vec<Arc<Activity>>,
}

impl NativeActivity for Parallel {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        for branch in &self.branches {
            metadata.add_child(branch);
        }
    }

    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult<()> {
        for branch in &self.branches {
            ctx.schedule_activity(branch, None)?;
        }
        Ok(())
    }
}

pub fn parallel(name: &str, branches: Vec<Arc<Activity>>) -> Arc<Activity> {
    Activity::native(name, Parallel { branches })
}

pub fn leaf(name: &str) -> Arc<Activity> {
    CodeFn::activity(name, |_ctx| Ok(Value::Null))
}

/// Condition activity replaying a fixed sequence of answers
pub fn scripted_condition(name: &str, answers: &[bool]) -> Arc<Activity> {
    let answers = Arc::new(Mutex::new(answers.iter().copied().collect::<VecDeque<_>>()));
    CodeFn::activity(name, move |_ctx| {
        Ok(Value::Bool(answers.lock().pop_front().unwrap_or(false)))
    })
}

/// What an [`External`] leaf observed
#[derive(Clone, Default)]
pub struct ExternalCalls {
    tokens: Arc<Mutex<Vec<AsyncToken>>>,
    cancel_calls: Arc<AtomicUsize>,
    aborting_calls: Arc<AtomicUsize>,
    ends: Arc<AtomicUsize>,
}

impl ExternalCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to the most recent `begin`
    pub fn token(&self) -> AsyncToken {
        self.tokens.lock().last().cloned().expect("begin was not called")
    }

    pub fn begins(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn aborting_calls(&self) -> usize {
        self.aborting_calls.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }
}

/// Async leaf that parks its token for the test to complete
pub struct External {
    calls: ExternalCalls,
    acknowledge_cancel: bool,
}

impl AsyncCodeActivity for External {
    fn begin(
        &self,
        _ctx: &mut AsyncCodeActivityContext<'_>,
        token: AsyncToken,
    ) -> ActivityResult<AsyncResult> {
        self.calls.tokens.lock().push(token.clone());
        Ok(token.pending())
    }

    fn end(
        &self,
        _ctx: &mut AsyncCodeActivityContext<'_>,
        outcome: OperationOutcome,
    ) -> ActivityResult<Option<Value>> {
        self.calls.ends.fetch_add(1, Ordering::SeqCst);
        match outcome {
            OperationOutcome::Completed(value) => Ok(Some(value)),
            OperationOutcome::Failed(fault) => Err(fault),
            OperationOutcome::Canceled => Ok(None),
        }
    }

    fn cancel(&self, ctx: &mut AsyncCodeActivityContext<'_>) {
        self.calls.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if ctx.is_aborting() {
            self.calls.aborting_calls.fetch_add(1, Ordering::SeqCst);
            return;
        }
        if self.acknowledge_cancel
            && let Some(token) = ctx.token()
        {
            token.report_canceled();
        }
    }
}

/// External leaf that ignores cancellation
pub fn external(name: &str, calls: &ExternalCalls) -> Arc<Activity> {
    Activity::async_code(
        name,
        External {
            calls: calls.clone(),
            acknowledge_cancel: false,
        },
    )
}

/// External leaf that acknowledges cancellation through its token
pub fn cooperative_external(name: &str, calls: &ExternalCalls) -> Arc<Activity> {
    Activity::async_code(
        name,
        External {
            calls: calls.clone(),
            acknowledge_cancel: true,
        },
    )
}

/// Executor with a recording observer attached, already started on `root`
pub fn started(root: Arc<Activity>) -> (ActivityExecutor, RecordingObserver) {
    let recorder = RecordingObserver::new();
    let mut exec = ActivityExecutor::new(ExecutorConfig {
        debug: true,
        ..ExecutorConfig::default()
    });
    exec.add_observer(recorder.clone());
    exec.start(root, BTreeMap::new()).unwrap();
    (exec, recorder)
}
