//! Activity instances and the instance tree
//!
//! An instance is one execution of one activity definition. It is driven by
//! discrete work items rather than running continuously, and tracks a busy
//! count of outstanding child and async work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::activity::{Activity, Callback};
use super::error::Fault;
use super::ids::InstanceId;

/// Lifecycle state of an activity instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Created, start work item not yet dispatched
    Created,
    /// Started and not yet finished
    Executing,
    /// Cancellation requested; waiting for outstanding work to drain
    Canceling,
    /// Finished normally
    Closed,
    /// Finished with an unhandled fault
    Faulted,
    /// Finished by cancellation without a result
    Canceled,
}

impl InstanceState {
    /// Whether the state is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Closed | InstanceState::Faulted | InstanceState::Canceled
        )
    }
}

/// Callbacks a parent registered for one child
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChildCallbacks {
    pub(crate) on_complete: Option<Callback>,
    pub(crate) on_fault: Option<Callback>,
}

/// One execution of one activity within the tree
#[derive(Debug)]
pub struct ActivityInstance {
    pub(crate) id: InstanceId,
    pub(crate) activity: Arc<Activity>,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) children: Vec<InstanceId>,
    pub(crate) child_callbacks: HashMap<InstanceId, ChildCallbacks>,
    pub(crate) busy_count: u32,
    pub(crate) state: InstanceState,
    pub(crate) arguments: BTreeMap<String, Value>,
    pub(crate) variables: BTreeMap<String, Value>,
    pub(crate) result: Option<Value>,
    pub(crate) fault: Option<Fault>,
    pub(crate) cancel_requested: bool,
    pub(crate) marked_canceled: bool,
    pub(crate) cancel_hook_invoked: bool,
}

impl ActivityInstance {
    pub(crate) fn new(id: InstanceId, activity: Arc<Activity>, parent: Option<InstanceId>) -> Self {
        Self {
            id,
            activity,
            parent,
            children: Vec::new(),
            child_callbacks: HashMap::new(),
            busy_count: 0,
            state: InstanceState::Created,
            arguments: BTreeMap::new(),
            variables: BTreeMap::new(),
            result: None,
            fault: None,
            cancel_requested: false,
            marked_canceled: false,
            cancel_hook_invoked: false,
        }
    }

    /// Instance identity
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Activity definition this instance executes
    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    /// Parent instance, `None` for the root
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Live children in scheduling order
    pub fn children(&self) -> &[InstanceId] {
        &self.children
    }

    /// Outstanding child and async work
    pub fn busy_count(&self) -> u32 {
        self.busy_count
    }

    /// Current lifecycle state
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Result produced so far
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Fault, when the instance faulted
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Resolved argument values
    pub fn arguments(&self) -> &BTreeMap<String, Value> {
        &self.arguments
    }

    /// Instance-local variables
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Whether cancellation was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub(crate) fn increment_busy(&mut self) {
        self.busy_count += 1;
    }

    pub(crate) fn decrement_busy(&mut self) {
        if self.busy_count == 0 {
            tracing::warn!(instance = %self.id, "busy count underflow ignored");
            return;
        }
        self.busy_count -= 1;
    }

    pub(crate) fn detach_child(&mut self, child: InstanceId) -> ChildCallbacks {
        self.children.retain(|c| *c != child);
        self.child_callbacks.remove(&child).unwrap_or_default()
    }

    /// Busy count attributable to async work rather than live children
    pub(crate) fn async_busy(&self) -> u32 {
        self.busy_count
            .saturating_sub(self.children.len() as u32)
    }
}

/// Arena of live instances keyed by id
#[derive(Debug, Default)]
pub struct InstanceTable {
    instances: BTreeMap<InstanceId, ActivityInstance>,
}

impl InstanceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an instance
    pub fn get(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut ActivityInstance> {
        self.instances.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, instance: ActivityInstance) {
        self.instances.insert(instance.id, instance);
    }

    pub(crate) fn remove(&mut self, id: InstanceId) -> Option<ActivityInstance> {
        self.instances.remove(&id)
    }

    /// Whether the instance exists
    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Number of instances in the table
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Iterate instances in id order
    pub fn iter(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.instances.values()
    }

    /// The instance and all its live descendants, parents before children
    pub fn subtree(&self, root: InstanceId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(instance) = self.instances.get(&id) {
                out.push(id);
                stack.extend(instance.children.iter().rev().copied());
            }
        }
        out
    }

    /// Resolve a name against the instance's own scope, then its ancestors
    ///
    /// At each level variables shadow arguments.
    pub fn lookup(&self, from: InstanceId, name: &str) -> Option<&Value> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let instance = self.instances.get(&id)?;
            if let Some(value) = instance.variables.get(name) {
                return Some(value);
            }
            if let Some(value) = instance.arguments.get(name) {
                return Some(value);
            }
            cursor = instance.parent;
        }
        None
    }

    /// Nearest instance (starting at `from`) that owns variable `name`
    pub(crate) fn variable_owner(&self, from: InstanceId, name: &str) -> Option<InstanceId> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let instance = self.instances.get(&id)?;
            if instance.variables.contains_key(name) {
                return Some(id);
            }
            cursor = instance.parent;
        }
        None
    }
}
