//! Closure-backed synchronous activity

use serde_json::Value;
use std::sync::Arc;

use crate::runtime::activity::{Activity, CodeActivity, InArgument, MetadataBuilder};
use crate::runtime::context::CodeActivityContext;
use crate::runtime::error::ActivityResult;

type CodeBody = dyn Fn(&mut CodeActivityContext<'_>) -> ActivityResult<Value> + Send + Sync;

/// Synchronous activity whose body is a closure
pub struct CodeFn {
    body: Arc<CodeBody>,
    arguments: Vec<(String, InArgument)>,
}

impl CodeFn {
    /// Wrap a closure
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut CodeActivityContext<'_>) -> ActivityResult<Value> + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(body),
            arguments: Vec::new(),
        }
    }

    /// Bind a required argument, readable through `ctx.argument(name)`
    pub fn with_argument(mut self, name: impl Into<String>, argument: impl Into<InArgument>) -> Self {
        self.arguments.push((name.into(), argument.into()));
        self
    }

    /// Finish into a shareable definition
    pub fn into_activity(self, name: impl Into<String>) -> Arc<Activity> {
        Activity::code(name, self)
    }

    /// Shorthand for `CodeFn::new(body).into_activity(name)`
    pub fn activity<F>(name: impl Into<String>, body: F) -> Arc<Activity>
    where
        F: Fn(&mut CodeActivityContext<'_>) -> ActivityResult<Value> + Send + Sync + 'static,
    {
        Self::new(body).into_activity(name)
    }
}

impl CodeActivity for CodeFn {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        for (name, argument) in &self.arguments {
            metadata.bind(name.clone(), Some(argument), true);
        }
    }

    fn execute(&self, ctx: &mut CodeActivityContext<'_>) -> ActivityResult<Value> {
        (self.body)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ActivityExecutor, ExecutorConfig, FaultKind, Outcome, RunStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_bound_arguments_reach_the_closure() {
        let double = CodeFn::new(|ctx| {
            let n = ctx.require_argument("n")?.as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        })
        .with_argument("n", json!(21))
        .into_activity("double");

        let mut exec = ActivityExecutor::new(ExecutorConfig::default());
        exec.start(double, BTreeMap::new()).unwrap();
        assert_eq!(
            exec.run_to_idle(),
            RunStatus::Completed(Outcome::Completed(Some(json!(42))))
        );
    }

    #[test]
    fn test_failed_binding_faults() {
        let reads_missing = CodeFn::new(|_ctx| Ok(Value::Null))
            .with_argument("x", InArgument::variable("nowhere"))
            .into_activity("reads-missing");

        let mut exec = ActivityExecutor::new(ExecutorConfig::default());
        exec.start(reads_missing, BTreeMap::new()).unwrap();

        let RunStatus::Completed(Outcome::Faulted(fault)) = exec.run_to_idle() else {
            panic!("expected a binding fault");
        };
        assert_eq!(fault.kind, FaultKind::Binding);
        assert!(fault.message.contains("nowhere"));
    }
}
