//! Execution contexts handed to activity code
//!
//! Each capability gets its own context type exposing only what that kind of
//! activity may do. All of them share [`ActivityContext`] for argument and
//! variable access.

use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::activity::{Activity, Callback};
use super::async_op::AsyncToken;
use super::bookmark::{Bookmark, BookmarkScope};
use super::error::{ActivityResult, Fault};
use super::executor::ActivityExecutor;
use super::ids::{InstanceId, WorkflowId};
use super::instance::{ChildCallbacks, InstanceTable};
use super::methods::MethodRegistry;

/// Read-only view of the names visible from one point in the tree
pub struct Environment<'a> {
    table: &'a InstanceTable,
    scope: Option<InstanceId>,
}

impl<'a> Environment<'a> {
    pub(crate) fn new(table: &'a InstanceTable, scope: Option<InstanceId>) -> Self {
        Self { table, scope }
    }

    /// Resolve a variable or argument name
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.scope.and_then(|scope| self.table.lookup(scope, name))
    }

    /// Resolve a name that must be a boolean
    pub fn get_bool(&self, name: &str) -> ActivityResult<bool> {
        self.get(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| Fault::binding(format!("'{}' is not a boolean in scope", name)))
    }

    /// Resolve a name that must be an integer
    pub fn get_i64(&self, name: &str) -> ActivityResult<i64> {
        self.get(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| Fault::binding(format!("'{}' is not an integer in scope", name)))
    }
}

/// State shared by every activity context
pub struct ActivityContext<'a> {
    pub(crate) executor: &'a mut ActivityExecutor,
    pub(crate) instance: InstanceId,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self { executor, instance }
    }

    /// Instance being executed
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Workflow this instance belongs to
    pub fn workflow_id(&self) -> WorkflowId {
        self.executor.workflow_id()
    }

    /// Display name of the executing activity
    pub fn activity_name(&self) -> &str {
        self.executor
            .instances
            .get(self.instance)
            .map(|i| i.activity.name())
            .unwrap_or_default()
    }

    /// Resolved argument of this instance
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.executor
            .instances
            .get(self.instance)
            .and_then(|i| i.arguments.get(name))
    }

    /// Resolved argument that must be present
    pub fn require_argument(&self, name: &str) -> ActivityResult<&Value> {
        self.argument(name)
            .ok_or_else(|| Fault::binding(format!("argument '{}' has no value", name)))
    }

    /// Resolved argument that must be a boolean
    pub fn bool_argument(&self, name: &str) -> ActivityResult<bool> {
        self.require_argument(name)?
            .as_bool()
            .ok_or_else(|| Fault::binding(format!("argument '{}' must be a boolean", name)))
    }

    /// Variable or argument visible from this instance
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.executor.instances.lookup(self.instance, name)
    }

    /// Assign the nearest declared variable named `name`
    pub fn set_variable(&mut self, name: &str, value: Value) -> ActivityResult<()> {
        let owner = self
            .executor
            .instances
            .variable_owner(self.instance, name)
            .ok_or_else(|| Fault::new(format!("variable '{}' is not declared in scope", name)))?;
        if let Some(instance) = self.executor.instances.get_mut(owner) {
            instance.variables.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Environment rooted at this instance
    pub fn environment(&self) -> Environment<'_> {
        Environment::new(&self.executor.instances, Some(self.instance))
    }

    /// Whether cancellation of this instance was requested
    pub fn is_cancellation_requested(&self) -> bool {
        self.executor
            .instances
            .get(self.instance)
            .is_some_and(|i| i.cancel_requested)
    }

    /// Record that this instance ends canceled rather than closed
    pub fn mark_canceled(&mut self) {
        if let Some(instance) = self.executor.instances.get_mut(self.instance) {
            instance.marked_canceled = true;
        }
    }
}

macro_rules! context_deref {
    ($ty:ident) => {
        impl<'a> Deref for $ty<'a> {
            type Target = ActivityContext<'a>;

            fn deref(&self) -> &Self::Target {
                &self.base
            }
        }

        impl<'a> DerefMut for $ty<'a> {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.base
            }
        }
    };
}

/// Context for synchronous activities
pub struct CodeActivityContext<'a> {
    base: ActivityContext<'a>,
}

impl<'a> CodeActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self {
            base: ActivityContext::new(executor, instance),
        }
    }
}

context_deref!(CodeActivityContext);

/// Context for control-flow activities
pub struct NativeActivityContext<'a> {
    base: ActivityContext<'a>,
}

impl<'a> NativeActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self {
            base: ActivityContext::new(executor, instance),
        }
    }

    /// Schedule a child; `on_complete` is invoked when it closes or is canceled
    pub fn schedule_activity(
        &mut self,
        child: &Arc<Activity>,
        on_complete: Option<Callback>,
    ) -> ActivityResult<InstanceId> {
        self.schedule(child, ChildCallbacks { on_complete, on_fault: None })
    }

    /// Schedule a child whose faults are delivered to `on_fault` instead of propagating
    pub fn schedule_activity_with_fault_handler(
        &mut self,
        child: &Arc<Activity>,
        on_complete: Option<Callback>,
        on_fault: Callback,
    ) -> ActivityResult<InstanceId> {
        self.schedule(
            child,
            ChildCallbacks {
                on_complete,
                on_fault: Some(on_fault),
            },
        )
    }

    fn schedule(&mut self, child: &Arc<Activity>, callbacks: ChildCallbacks) -> ActivityResult<InstanceId> {
        let parent = self.base.instance;
        self.base
            .executor
            .schedule_child_with(parent, child, callbacks)
            .map_err(|err| Fault::protocol_violation(err.to_string()))
    }

    /// Register a bookmark owned by this instance
    pub fn create_bookmark(
        &mut self,
        name: impl Into<String>,
        scope: BookmarkScope,
        callback: Callback,
    ) -> ActivityResult<Bookmark> {
        let owner = self.base.instance;
        Ok(self.base.executor.create_bookmark(owner, name, scope, callback)?)
    }

    /// Set this instance's result
    pub fn set_result(&mut self, value: Value) {
        if let Some(instance) = self.base.executor.instances.get_mut(self.base.instance) {
            instance.result = Some(value);
        }
    }

    /// Request cancellation of one of this instance's children
    ///
    /// A child that already finished but whose completion has not been
    /// delivered yet is still listed; canceling it is a no-op.
    pub fn cancel_child(&mut self, child: InstanceId) -> ActivityResult<()> {
        let executor = &mut *self.base.executor;
        let listed = executor
            .instances
            .get(self.base.instance)
            .is_some_and(|parent| parent.children.contains(&child));
        if !listed {
            return Err(Fault::protocol_violation(format!(
                "instance {} is not a child of {}",
                child, self.base.instance
            )));
        }
        if executor.instances.contains(child) {
            executor.cancel_subtree(child);
        }
        Ok(())
    }

    /// Live children of this instance
    pub fn children(&self) -> Vec<InstanceId> {
        self.base
            .executor
            .instances
            .get(self.base.instance)
            .map(|i| i.children.clone())
            .unwrap_or_default()
    }
}

context_deref!(NativeActivityContext);

/// Context for async-capable leaf activities
pub struct AsyncCodeActivityContext<'a> {
    base: ActivityContext<'a>,
}

impl<'a> AsyncCodeActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self {
            base: ActivityContext::new(executor, instance),
        }
    }

    /// Token of the pending operation, if one is pending
    pub fn token(&self) -> Option<AsyncToken> {
        self.base
            .executor
            .pending_operations
            .get(&self.base.instance)
            .map(|op| op.token.clone())
    }

    /// Stash state between `begin` and `end`
    pub fn set_user_state(&mut self, value: Value) {
        if let Some(op) = self.base.executor.pending_operations.get_mut(&self.base.instance) {
            op.user_state = Some(value);
        }
    }

    /// State stashed by `begin`
    pub fn user_state(&self) -> Option<&Value> {
        self.base
            .executor
            .pending_operations
            .get(&self.base.instance)
            .and_then(|op| op.user_state.as_ref())
    }

    /// Whether the cancellation hook is running on behalf of abort
    pub fn is_aborting(&self) -> bool {
        self.base
            .executor
            .pending_operations
            .get(&self.base.instance)
            .is_some_and(|op| op.is_aborting)
    }

    /// Method registry injected into the executor
    pub fn methods(&self) -> Arc<MethodRegistry> {
        self.base.executor.methods().clone()
    }
}

context_deref!(AsyncCodeActivityContext);
