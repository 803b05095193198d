//! Activity definitions, capability traits, and metadata
//!
//! An [`Activity`] is an immutable, shareable template. Its body is one of a
//! closed set of capability variants:
//! - Synchronous: runs to completion inside one work item ([`CodeActivity`])
//! - Async: begins an external operation and is finished later ([`AsyncCodeActivity`])
//! - ControlFlow: schedules children and bookmarks ([`NativeActivity`])
//!
//! The executor dispatches on the variant. Metadata (argument slots, declared
//! variables, children, validation errors) is computed once per definition and
//! never depends on an executor. Checks against an executor's
//! [`MethodRegistry`] run separately on every start.

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};

use super::async_op::{AsyncResult, AsyncToken, OperationOutcome};
use super::context::{AsyncCodeActivityContext, CodeActivityContext, Environment, NativeActivityContext};
use super::error::{ActivityResult, Fault, ValidationError};
use super::ids::InstanceId;
use super::instance::InstanceState;
use super::methods::MethodRegistry;

/// Name of a completion or resumption callback on a control-flow activity
///
/// Callbacks are named rather than stored as closures so the pending
/// continuation of an instance is plain data.
pub type Callback = &'static str;

/// Closure type behind [`InArgument::Expr`]
pub type ArgumentExpr = Arc<dyn Fn(&Environment<'_>) -> ActivityResult<Value> + Send + Sync>;

/// Immutable activity definition
pub struct Activity {
    name: String,
    body: ActivityBody,
    metadata: OnceLock<ActivityMetadata>,
}

/// Capability-tagged activity body
#[derive(Clone)]
pub enum ActivityBody {
    /// Runs synchronously and produces a value
    Synchronous(Arc<dyn CodeActivity>),
    /// Begins an external operation and finishes when it reports back
    Async(Arc<dyn AsyncCodeActivity>),
    /// Schedules children and bookmarks
    ControlFlow(Arc<dyn NativeActivity>),
}

impl ActivityBody {
    /// Short label for the variant
    pub fn label(&self) -> &'static str {
        match self {
            ActivityBody::Synchronous(_) => "synchronous",
            ActivityBody::Async(_) => "async",
            ActivityBody::ControlFlow(_) => "control-flow",
        }
    }
}

impl Activity {
    /// Create an activity from a body
    pub fn new(name: impl Into<String>, body: ActivityBody) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            body,
            metadata: OnceLock::new(),
        })
    }

    /// Create a synchronous activity
    pub fn code(name: impl Into<String>, activity: impl CodeActivity + 'static) -> Arc<Self> {
        Self::new(name, ActivityBody::Synchronous(Arc::new(activity)))
    }

    /// Create an async-capable leaf activity
    pub fn async_code(
        name: impl Into<String>,
        activity: impl AsyncCodeActivity + 'static,
    ) -> Arc<Self> {
        Self::new(name, ActivityBody::Async(Arc::new(activity)))
    }

    /// Create a control-flow activity
    pub fn native(name: impl Into<String>, activity: impl NativeActivity + 'static) -> Arc<Self> {
        Self::new(name, ActivityBody::ControlFlow(Arc::new(activity)))
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability-tagged body
    pub fn body(&self) -> &ActivityBody {
        &self.body
    }

    /// Compile (once) and return this definition's metadata
    pub fn metadata(&self) -> &ActivityMetadata {
        self.metadata.get_or_init(|| {
            let mut builder = MetadataBuilder::new(&self.name);
            match &self.body {
                ActivityBody::Synchronous(a) => a.cache_metadata(&mut builder),
                ActivityBody::Async(a) => a.cache_metadata(&mut builder),
                ActivityBody::ControlFlow(a) => a.cache_metadata(&mut builder),
            }
            builder.finish()
        })
    }

    /// Validation errors against one executor's method registry
    ///
    /// Not cached: the same definition may be started on executors with
    /// different registries.
    pub fn method_errors(&self, methods: &MethodRegistry) -> Vec<ValidationError> {
        let ActivityBody::Async(leaf) = &self.body else {
            return Vec::new();
        };
        leaf.validate_methods(methods)
            .into_iter()
            .map(|message| ValidationError::new(self.name.as_str(), message))
            .collect()
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("name", &self.name)
            .field("kind", &self.body.label())
            .finish()
    }
}

/// Synchronous activity: runs to completion inside its start work item
pub trait CodeActivity: Send + Sync {
    /// Declare arguments and report validation errors
    fn cache_metadata(&self, _metadata: &mut MetadataBuilder<'_>) {}

    /// Execute and produce the activity's result
    fn execute(&self, ctx: &mut CodeActivityContext<'_>) -> ActivityResult<Value>;
}

/// Async-capable leaf activity
///
/// `begin` runs once per execution and either completes synchronously
/// ([`AsyncToken::completed`]) or hands the token to external code and returns
/// [`AsyncToken::pending`]. `end` runs exactly once when the operation resolves.
pub trait AsyncCodeActivity: Send + Sync {
    /// Declare arguments and report validation errors
    fn cache_metadata(&self, _metadata: &mut MetadataBuilder<'_>) {}

    /// Start the operation
    fn begin(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        token: AsyncToken,
    ) -> ActivityResult<AsyncResult>;

    /// Finish the operation and produce the result (or `None` for no result)
    fn end(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        outcome: OperationOutcome,
    ) -> ActivityResult<Option<Value>>;

    /// Cooperative cleanup on cancel or abort
    fn cancel(&self, _ctx: &mut AsyncCodeActivityContext<'_>) {}

    /// Check the methods this leaf needs against an executor's registry
    fn validate_methods(&self, _methods: &MethodRegistry) -> Vec<String> {
        Vec::new()
    }
}

/// Control-flow activity: schedules children, creates bookmarks
pub trait NativeActivity: Send + Sync {
    /// Declare arguments, variables, children, and validation errors
    fn cache_metadata(&self, _metadata: &mut MetadataBuilder<'_>) {}

    /// Called once by the start work item
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult<()>;

    /// Called when a child scheduled with `callback` closes or is canceled
    fn on_child_completed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: Callback,
        _completion: &ChildCompletion,
    ) -> ActivityResult<()> {
        Ok(())
    }

    /// Called when a child scheduled with fault handler `callback` faults
    ///
    /// Returning `Ok` absorbs the fault; returning `Err` faults this instance.
    fn on_child_faulted(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: Callback,
        fault: &Fault,
    ) -> ActivityResult<()> {
        Err(fault.clone())
    }

    /// Called when a bookmark created with `callback` is resumed
    fn on_bookmark_resumed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: Callback,
        _payload: Value,
    ) -> ActivityResult<()> {
        Ok(())
    }

    /// Cooperative cancellation hook; children are canceled by the executor
    fn cancel(&self, _ctx: &mut NativeActivityContext<'_>) {}
}

/// Report delivered to a parent when a child reaches `Closed` or `Canceled`
#[derive(Debug, Clone, PartialEq)]
pub struct ChildCompletion {
    /// The completed child
    pub instance: InstanceId,
    /// Child activity display name
    pub activity: String,
    /// Terminal state of the child
    pub state: InstanceState,
    /// Result produced by the child, if any
    pub result: Option<Value>,
}

impl ChildCompletion {
    /// Result as a boolean, if the child produced one
    pub fn result_bool(&self) -> Option<bool> {
        self.result.as_ref().and_then(Value::as_bool)
    }
}

/// Source of an input argument value
#[derive(Clone)]
pub enum InArgument {
    /// Fixed value
    Literal(Value),
    /// Value of a variable visible from the instance's parent chain
    Variable(String),
    /// Computed from the environment when the instance starts
    Expr(ArgumentExpr),
}

impl InArgument {
    /// Build an argument from a closure
    pub fn expr<F>(f: F) -> Self
    where
        F: Fn(&Environment<'_>) -> ActivityResult<Value> + Send + Sync + 'static,
    {
        InArgument::Expr(Arc::new(f))
    }

    /// Build an argument reading a variable
    pub fn variable(name: impl Into<String>) -> Self {
        InArgument::Variable(name.into())
    }

    pub(crate) fn evaluate(&self, env: &Environment<'_>) -> ActivityResult<Value> {
        match self {
            InArgument::Literal(value) => Ok(value.clone()),
            InArgument::Variable(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| Fault::binding(format!("variable '{}' is not in scope", name))),
            InArgument::Expr(f) => f(env),
        }
    }
}

impl fmt::Debug for InArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InArgument::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            InArgument::Variable(name) => f.debug_tuple("Variable").field(name).finish(),
            InArgument::Expr(_) => f.write_str("Expr(..)"),
        }
    }
}

impl From<Value> for InArgument {
    fn from(value: Value) -> Self {
        InArgument::Literal(value)
    }
}

impl From<bool> for InArgument {
    fn from(value: bool) -> Self {
        InArgument::Literal(Value::Bool(value))
    }
}

/// A declared argument slot and its binding
#[derive(Debug, Clone)]
pub struct ArgumentSlot {
    /// Argument name
    pub name: String,
    /// Binding; unbound slots are filled from root inputs
    pub binding: Option<InArgument>,
    /// Whether a value must be supplied
    pub required: bool,
}

/// A declared variable with its initial value
#[derive(Debug, Clone)]
pub struct VariableDecl {
    /// Variable name
    pub name: String,
    /// Initial value
    pub default: Value,
}

/// Compiled metadata of one activity definition
#[derive(Debug, Clone, Default)]
pub struct ActivityMetadata {
    /// Bound argument slots, in declaration order
    pub arguments: Vec<ArgumentSlot>,
    /// Declared variables
    pub variables: Vec<VariableDecl>,
    /// Child activities reachable from this definition
    pub children: Vec<Arc<Activity>>,
    /// Validation errors
    pub errors: Vec<ValidationError>,
}

/// Builder passed to `cache_metadata`
pub struct MetadataBuilder<'a> {
    activity: &'a str,
    metadata: ActivityMetadata,
}

impl<'a> MetadataBuilder<'a> {
    fn new(activity: &'a str) -> Self {
        Self {
            activity,
            metadata: ActivityMetadata::default(),
        }
    }

    /// Bind an argument slot
    ///
    /// A required slot with no binding must be satisfied by a root input.
    pub fn bind(&mut self, name: impl Into<String>, binding: Option<&InArgument>, required: bool) {
        self.metadata.arguments.push(ArgumentSlot {
            name: name.into(),
            binding: binding.cloned(),
            required,
        });
    }

    /// Declare an instance-local variable
    pub fn declare_variable(&mut self, name: impl Into<String>, default: Value) {
        self.metadata.variables.push(VariableDecl {
            name: name.into(),
            default,
        });
    }

    /// Register a child activity
    pub fn add_child(&mut self, child: &Arc<Activity>) {
        self.metadata.children.push(child.clone());
    }

    /// Register an optional child activity
    pub fn add_optional_child(&mut self, child: Option<&Arc<Activity>>) {
        if let Some(child) = child {
            self.add_child(child);
        }
    }

    /// Report a validation error
    pub fn add_validation_error(&mut self, message: impl Into<String>) {
        self.metadata
            .errors
            .push(ValidationError::new(self.activity, message));
    }

    fn finish(self) -> ActivityMetadata {
        self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Constant(Value);

    impl CodeActivity for Constant {
        fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
            metadata.bind("Value", Some(&InArgument::Literal(self.0.clone())), true);
        }

        fn execute(&self, _ctx: &mut CodeActivityContext<'_>) -> ActivityResult<Value> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_metadata_is_compiled_once() {
        let activity = Activity::code("constant", Constant(json!(7)));

        let first = activity.metadata() as *const ActivityMetadata;
        let second = activity.metadata() as *const ActivityMetadata;

        assert_eq!(first, second);
        assert_eq!(activity.metadata().arguments.len(), 1);
        assert!(activity.metadata().errors.is_empty());
        assert!(activity.method_errors(&MethodRegistry::new(4)).is_empty());
    }

    #[test]
    fn test_body_label() {
        let activity = Activity::code("constant", Constant(Value::Null));
        assert_eq!(activity.body().label(), "synchronous");
        assert_eq!(format!("{:?}", activity), "Activity { name: \"constant\", kind: \"synchronous\" }");
    }

    #[test]
    fn test_child_completion_bool() {
        let completion = ChildCompletion {
            instance: InstanceId(2),
            activity: "cond".into(),
            state: InstanceState::Closed,
            result: Some(json!(true)),
        };
        assert_eq!(completion.result_bool(), Some(true));
    }
}
