//! Method invocation through the injected registry

use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::runtime::activity::{Activity, AsyncCodeActivity, InArgument, MetadataBuilder};
use crate::runtime::async_op::{AsyncResult, AsyncToken, OperationOutcome};
use crate::runtime::context::AsyncCodeActivityContext;
use crate::runtime::error::{ActivityResult, Fault};
use crate::runtime::methods::{MethodFn, MethodRegistry};

/// Calls `target.method(parameters...)` from the executor's [`MethodRegistry`]
///
/// Runs inline by default. With `run_asynchronously` the call moves to a
/// blocking worker (tokio's blocking pool when a runtime is present, a plain
/// thread otherwise) and reports back through the async bridge.
///
/// [`MethodRegistry`]: crate::runtime::methods::MethodRegistry
pub struct InvokeMethod {
    target: String,
    method: String,
    parameters: Vec<InArgument>,
    run_asynchronously: bool,
}

impl InvokeMethod {
    /// Invoke `target.method`
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            parameters: Vec::new(),
            run_asynchronously: false,
        }
    }

    /// Append a positional parameter
    pub fn parameter(mut self, parameter: impl Into<InArgument>) -> Self {
        self.parameters.push(parameter.into());
        self
    }

    /// Run the call on a worker instead of inline
    pub fn run_asynchronously(mut self, enabled: bool) -> Self {
        self.run_asynchronously = enabled;
        self
    }

    /// Finish into a shareable definition
    pub fn into_activity(self, name: impl Into<String>) -> Arc<Activity> {
        Activity::async_code(name, self)
    }

    fn parameter_name(index: usize) -> String {
        format!("Parameter{}", index)
    }
}

fn call(method: &MethodFn, args: &[Value]) -> ActivityResult<Value> {
    match catch_unwind(AssertUnwindSafe(|| method(args))) {
        Ok(result) => result,
        Err(_) => Err(Fault::panic("method panicked")),
    }
}

impl AsyncCodeActivity for InvokeMethod {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        for (index, parameter) in self.parameters.iter().enumerate() {
            metadata.bind(Self::parameter_name(index), Some(parameter), true);
        }
    }

    fn validate_methods(&self, methods: &MethodRegistry) -> Vec<String> {
        let arity = self.parameters.len();
        if !methods.has_method(&self.target, &self.method) {
            vec![format!("method '{}.{}' is not registered", self.target, self.method)]
        } else if methods.resolve(&self.target, &self.method, arity).is_none() {
            vec![format!(
                "no overload of '{}.{}' takes {} parameter(s)",
                self.target, self.method, arity
            )]
        } else {
            Vec::new()
        }
    }

    fn begin(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        token: AsyncToken,
    ) -> ActivityResult<AsyncResult> {
        let arity = self.parameters.len();
        let method = ctx
            .methods()
            .resolve(&self.target, &self.method, arity)
            .ok_or_else(|| {
                Fault::new(format!("method '{}.{}' cannot be resolved", self.target, self.method))
            })?;
        let args = (0..arity)
            .map(|index| ctx.require_argument(&Self::parameter_name(index)).cloned())
            .collect::<ActivityResult<Vec<Value>>>()?;

        if !self.run_asynchronously {
            return Ok(token.completed(call(&method, &args)));
        }

        let pending = token.pending();
        let work = move || {
            token.report_completion(call(&method, &args));
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(work);
            }
            Err(_) => {
                std::thread::spawn(work);
            }
        }
        Ok(pending)
    }

    fn end(
        &self,
        _ctx: &mut AsyncCodeActivityContext<'_>,
        outcome: OperationOutcome,
    ) -> ActivityResult<Option<Value>> {
        match outcome {
            OperationOutcome::Completed(value) => Ok(Some(value)),
            OperationOutcome::Failed(fault) => Err(fault),
            OperationOutcome::Canceled => Ok(None),
        }
    }
}
