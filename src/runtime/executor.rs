//! The activity executor
//!
//! Owns one activity tree: the instance table, the work-item queue, the
//! bookmark table, and the pending async operations. All of it is mutated only
//! from the dispatch loop (`run_to_idle`) and the caller-facing methods, which
//! take `&mut self`. The completion inbox is the one shared structure; tokens
//! push into it from any thread and the loop drains it before each dequeue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::ExecutorConfig;
use super::activity::{
    Activity, ActivityBody, AsyncCodeActivity, Callback, ChildCompletion, NativeActivity,
};
use super::async_op::{AsyncOperationContext, AsyncResult, AsyncToken, CompletionInbox, OperationOutcome};
use super::bookmark::{Bookmark, BookmarkManager, BookmarkScope, ResumeResult};
use super::context::{AsyncCodeActivityContext, CodeActivityContext, Environment, NativeActivityContext};
use super::error::{
    ActivityResult, BookmarkResult, ExecutorError, ExecutorResult, Fault, FaultKind, ValidationError,
};
use super::ids::{IdAllocator, InstanceId, LogicalClock, OperationId, WorkflowId};
use super::instance::{ActivityInstance, ChildCallbacks, InstanceState, InstanceTable};
use super::methods::MethodRegistry;
use super::scheduler::{Priority, Scheduler, WorkAction, WorkItem};
use super::snapshot::{InstanceSnapshot, PendingOperationSnapshot, TreeSnapshot};
use super::tracking::{ExecutionTrace, LifecycleEvent, LifecycleObserver, Tracker};

/// Terminal outcome of the root instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Closed normally, with the root's result if it produced one
    Completed(Option<Value>),
    /// An unhandled fault reached the root
    Faulted(Fault),
    /// Canceled or aborted
    Canceled,
}

impl Outcome {
    /// Whether the root closed normally
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Result value, when the root closed with one
    pub fn result(&self) -> Option<&Value> {
        match self {
            Outcome::Completed(result) => result.as_ref(),
            _ => None,
        }
    }

    /// Fault, when the root faulted
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Outcome::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Why `run_to_idle` returned
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// The root reached a terminal state
    Completed(Outcome),
    /// The queue is empty; the tree waits on bookmarks or async operations
    Idle,
    /// The per-pass work-item limit was reached with work still queued
    Yielded,
}

impl RunStatus {
    /// Whether the root finished
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed(_))
    }
}

/// Owner and driver of one activity tree
pub struct ActivityExecutor {
    workflow_id: WorkflowId,
    config: ExecutorConfig,
    ids: IdAllocator,
    pub(crate) instances: InstanceTable,
    pub(crate) bookmarks: BookmarkManager,
    scheduler: Scheduler,
    pub(crate) pending_operations: BTreeMap<InstanceId, AsyncOperationContext>,
    inbox: Arc<CompletionInbox>,
    methods: Arc<MethodRegistry>,
    tracker: Tracker,
    root: Option<InstanceId>,
    outcome: Option<Outcome>,
    abort_reason: Option<String>,
    dispatched: u64,
}

impl ActivityExecutor {
    /// Create an executor with its own method registry
    pub fn new(config: ExecutorConfig) -> Self {
        let methods = Arc::new(MethodRegistry::new(config.method_cache_capacity));
        Self::with_methods(config, methods)
    }

    /// Create an executor that resolves methods through `methods`
    pub fn with_methods(config: ExecutorConfig, methods: Arc<MethodRegistry>) -> Self {
        Self {
            workflow_id: WorkflowId::new(),
            tracker: Tracker::new(config.record_trace),
            config,
            ids: IdAllocator::default(),
            instances: InstanceTable::new(),
            bookmarks: BookmarkManager::new(),
            scheduler: Scheduler::new(),
            pending_operations: BTreeMap::new(),
            inbox: Arc::new(CompletionInbox::new()),
            methods,
            root: None,
            outcome: None,
            abort_reason: None,
            dispatched: 0,
        }
    }

    /// Register a lifecycle observer
    pub fn add_observer(&mut self, observer: impl LifecycleObserver + 'static) {
        self.tracker.add_observer(Box::new(observer));
    }

    /// Get the current configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Workflow identity
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// Method registry shared with async leaves
    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.methods
    }

    /// Inbox external completions are pushed into
    pub fn completion_inbox(&self) -> Arc<CompletionInbox> {
        self.inbox.clone()
    }

    /// Root instance, once started
    pub fn root(&self) -> Option<InstanceId> {
        self.root
    }

    /// Terminal outcome, once the root finished
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Reason passed to the abort that ended the tree, if any
    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Live instances
    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    /// Look up a live instance
    pub fn instance(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(id)
    }

    /// Live bookmarks
    pub fn bookmarks(&self) -> &BookmarkManager {
        &self.bookmarks
    }

    /// Pending async operation of an instance
    pub fn pending_operation(&self, id: InstanceId) -> Option<&AsyncOperationContext> {
        self.pending_operations.get(&id)
    }

    /// Number of async operations awaiting completion
    pub fn pending_operation_count(&self) -> usize {
        self.pending_operations.len()
    }

    /// Dispatch trace, when recording is enabled
    pub fn trace(&self) -> Option<&ExecutionTrace> {
        self.tracker.trace()
    }

    /// Number of work items dispatched so far
    pub fn work_items_dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Number of queued work items
    pub fn queued_work_items(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Compile the tree and enqueue the root's start work item
    ///
    /// `inputs` become the root's arguments; unbound required root slots must
    /// be present. Nothing runs until [`run_to_idle`](Self::run_to_idle).
    pub fn start(
        &mut self,
        root: Arc<Activity>,
        inputs: BTreeMap<String, Value>,
    ) -> ExecutorResult<InstanceId> {
        if self.root.is_some() {
            return Err(ExecutorError::AlreadyStarted);
        }

        let errors = self.compile(&root, &inputs);
        if !errors.is_empty() {
            tracing::warn!(
                activity = root.name(),
                errors = errors.len(),
                "refusing to start: validation failed"
            );
            return Err(ExecutorError::Validation(errors));
        }

        let id = self.ids.instance();
        let mut instance = ActivityInstance::new(id, root, None);
        instance.arguments = inputs;
        self.instances.insert(instance);
        self.root = Some(id);
        self.enqueue(id, WorkAction::Start);

        tracing::info!(workflow = %self.workflow_id, root = %id, "workflow started");
        Ok(id)
    }

    /// Collect validation errors across every definition reachable from `root`
    fn compile(&self, root: &Arc<Activity>, inputs: &BTreeMap<String, Value>) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen: HashSet<*const Activity> = HashSet::new();
        let mut stack = vec![root.clone()];

        while let Some(activity) = stack.pop() {
            if !seen.insert(Arc::as_ptr(&activity)) {
                continue;
            }
            let metadata = activity.metadata();
            errors.extend(metadata.errors.iter().cloned());
            errors.extend(activity.method_errors(&self.methods));

            let is_root = Arc::ptr_eq(&activity, root);
            for slot in metadata.arguments.iter().filter(|s| s.required && s.binding.is_none()) {
                if !is_root {
                    errors.push(ValidationError::new(
                        activity.name(),
                        format!("required argument '{}' is not bound", slot.name),
                    ));
                } else if !inputs.contains_key(&slot.name) {
                    errors.push(ValidationError::new(
                        activity.name(),
                        format!("required input '{}' was not supplied", slot.name),
                    ));
                }
            }

            stack.extend(metadata.children.iter().rev().cloned());
        }

        errors
    }

    /// Drain the work queue until the tree completes, blocks, or runs out of fuel
    pub fn run_to_idle(&mut self) -> RunStatus {
        let mut fuel = self.config.max_work_items_per_pass;

        loop {
            self.drain_inbox();

            if fuel == Some(0) && self.scheduler.has_ready_items() {
                tracing::debug!(queued = self.scheduler.pending_count(), "work-item budget exhausted");
                return RunStatus::Yielded;
            }

            let Some(item) = self.scheduler.next_item() else {
                break;
            };
            self.dispatch(item);

            if let Some(remaining) = fuel.as_mut() {
                *remaining -= 1;
            }
        }

        match &self.outcome {
            Some(outcome) => RunStatus::Completed(outcome.clone()),
            None => RunStatus::Idle,
        }
    }

    /// Move claimed completions from the inbox onto the work queue
    fn drain_inbox(&mut self) {
        for completion in self.inbox.drain() {
            let expected = self
                .pending_operations
                .get(&completion.instance)
                .map(AsyncOperationContext::operation);
            if expected != Some(completion.operation) {
                self.discard_completion(completion.operation, completion.instance);
                continue;
            }
            self.enqueue(
                completion.instance,
                WorkAction::CompleteAsync {
                    operation: completion.operation,
                    outcome: completion.outcome,
                },
            );
        }
    }

    fn discard_completion(&mut self, operation: OperationId, instance: InstanceId) {
        tracing::warn!(%operation, %instance, "discarding completion for operation that is no longer pending");
        self.tracker
            .emit(LifecycleEvent::CompletionDiscarded { operation, instance });
    }

    fn enqueue(&mut self, instance: InstanceId, action: WorkAction) -> LogicalClock {
        self.enqueue_with_priority(instance, action, Priority::Normal)
    }

    fn enqueue_with_priority(
        &mut self,
        instance: InstanceId,
        action: WorkAction,
        priority: Priority,
    ) -> LogicalClock {
        let label = action.label();
        let seq = self.scheduler.enqueue_with_priority(instance, action, priority);
        self.tracker.emit(LifecycleEvent::WorkItemScheduled {
            seq,
            instance,
            action: label.to_string(),
        });
        seq
    }

    fn dispatch(&mut self, item: WorkItem) {
        let WorkItem {
            seq, instance: id, action, ..
        } = item;
        let label = action.label();

        let Some(instance) = self.instances.get(id) else {
            tracing::debug!(instance = %id, action = label, "skipping work item for departed instance");
            return;
        };
        let activity = instance.activity.clone();

        self.dispatched += 1;
        self.tracker.record(seq, id, activity.name(), label);
        tracing::debug!(seq = seq.0, instance = %id, activity = activity.name(), action = label, "dispatching work item");

        match action {
            WorkAction::Start => self.on_start(id, &activity),
            WorkAction::ResumeBookmark {
                name,
                scope,
                callback,
                payload,
            } => self.on_bookmark_resumed(id, &activity, name, scope, callback, payload),
            WorkAction::CompleteAsync { operation, outcome } => {
                self.on_async_completed(id, operation, outcome)
            }
            WorkAction::ChildCompleted(completion) => self.on_child_completed(id, &activity, completion),
            WorkAction::PropagateFault { child, fault } => {
                self.on_child_faulted(id, &activity, child, fault)
            }
        }

        self.tracker.emit(LifecycleEvent::WorkItemCompleted {
            seq,
            instance: id,
            action: label.to_string(),
        });

        if self.config.debug {
            self.check_busy_counts();
        }
    }

    /// Run activity code, turning a panic into a fault
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> ActivityResult<T>) -> ActivityResult<T> {
        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => Err(Fault::panic(panic_message(payload.as_ref()))),
        }
    }

    fn on_start(&mut self, id: InstanceId, activity: &Arc<Activity>) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if instance.state != InstanceState::Created {
            tracing::debug!(instance = %id, state = ?instance.state, "ignoring stale start");
            return;
        }
        instance.state = InstanceState::Executing;
        let parent = instance.parent;

        self.tracker.emit(LifecycleEvent::InstanceStarted {
            instance: id,
            activity: activity.name().to_string(),
        });

        if let Err(fault) = self.bind_arguments(id, parent, activity) {
            self.fault_instance(id, fault);
            return;
        }

        match activity.body().clone() {
            ActivityBody::Synchronous(code) => {
                let result = self.guarded(|exec| {
                    let mut ctx = CodeActivityContext::new(exec, id);
                    code.execute(&mut ctx)
                });
                match result {
                    Ok(value) => {
                        if let Some(instance) = self.instances.get_mut(id) {
                            instance.result = Some(value);
                        }
                        self.try_complete(id);
                    }
                    Err(fault) => self.fault_instance(id, fault),
                }
            }
            ActivityBody::Async(leaf) => self.begin_async(id, leaf),
            ActivityBody::ControlFlow(native) => {
                let result = self.guarded(|exec| {
                    let mut ctx = NativeActivityContext::new(exec, id);
                    native.execute(&mut ctx)
                });
                match result {
                    Ok(()) => self.try_complete(id),
                    Err(fault) => self.fault_instance(id, fault),
                }
            }
        }
    }

    /// Seed declared variables and resolve bound argument slots
    fn bind_arguments(
        &mut self,
        id: InstanceId,
        parent: Option<InstanceId>,
        activity: &Arc<Activity>,
    ) -> ActivityResult<()> {
        let metadata = activity.metadata();

        let mut resolved = Vec::with_capacity(metadata.arguments.len());
        {
            let env = Environment::new(&self.instances, parent);
            for slot in &metadata.arguments {
                let Some(binding) = &slot.binding else {
                    continue;
                };
                let value = binding.evaluate(&env).map_err(|fault| Fault {
                    kind: FaultKind::Binding,
                    message: format!("argument '{}': {}", slot.name, fault.message),
                    origin: fault.origin,
                })?;
                resolved.push((slot.name.clone(), value));
            }
        }

        if let Some(instance) = self.instances.get_mut(id) {
            for decl in &metadata.variables {
                instance.variables.insert(decl.name.clone(), decl.default.clone());
            }
            instance.arguments.extend(resolved);
        }
        Ok(())
    }

    fn begin_async(&mut self, id: InstanceId, leaf: Arc<dyn AsyncCodeActivity>) {
        if self.pending_operations.contains_key(&id) {
            self.fault_instance(
                id,
                Fault::protocol_violation(format!("instance {} already has a pending operation", id)),
            );
            return;
        }

        let operation = self.ids.operation();
        let token = AsyncToken::new(operation, id, self.inbox.clone());
        self.pending_operations
            .insert(id, AsyncOperationContext::new(token.clone()));
        if let Some(instance) = self.instances.get_mut(id) {
            instance.increment_busy();
        }
        self.tracker
            .emit(LifecycleEvent::OperationBegun { operation, instance: id });

        let begun = self.guarded(|exec| {
            let mut ctx = AsyncCodeActivityContext::new(exec, id);
            leaf.begin(&mut ctx, token.clone())
        });

        match begun {
            Err(fault) => {
                self.release_operation(id);
                self.fault_instance(id, fault);
            }
            Ok(result) if result.operation() != operation => {
                self.release_operation(id);
                self.fault_instance(
                    id,
                    Fault::protocol_violation(format!(
                        "begin returned operation {} but was given {}",
                        result.operation(),
                        operation
                    )),
                );
            }
            Ok(AsyncResult::Pending { .. }) => {
                tracing::debug!(instance = %id, %operation, "async operation pending");
            }
            Ok(AsyncResult::Completed { outcome, .. }) => {
                if token.complete_inline() {
                    self.finish_async(id, leaf, outcome);
                } else {
                    // A report through the token already claimed the operation
                    tracing::debug!(instance = %id, %operation, "inline result lost to reported completion");
                }
            }
        }
    }

    /// Drop a pending operation without running `end`
    fn release_operation(&mut self, id: InstanceId) {
        if let Some(op) = self.pending_operations.remove(&id) {
            op.token.force_release();
            if let Some(instance) = self.instances.get_mut(id) {
                instance.decrement_busy();
            }
        }
    }

    fn on_async_completed(&mut self, id: InstanceId, operation: OperationId, outcome: OperationOutcome) {
        let current = self
            .pending_operations
            .get(&id)
            .map(AsyncOperationContext::operation);
        if current != Some(operation) {
            self.discard_completion(operation, id);
            return;
        }

        let leaf = match self.instances.get(id).map(|i| i.activity.body().clone()) {
            Some(ActivityBody::Async(leaf)) => leaf,
            _ => return,
        };
        self.finish_async(id, leaf, outcome);
    }

    /// Run `end` once for the pending operation and settle the instance
    fn finish_async(&mut self, id: InstanceId, leaf: Arc<dyn AsyncCodeActivity>, outcome: OperationOutcome) {
        let canceled = matches!(outcome, OperationOutcome::Canceled);
        let ended = self.guarded(|exec| {
            let mut ctx = AsyncCodeActivityContext::new(exec, id);
            leaf.end(&mut ctx, outcome)
        });

        if let Some(op) = self.pending_operations.remove(&id) {
            self.tracker.emit(LifecycleEvent::OperationCompleted {
                operation: op.operation(),
                instance: id,
            });
        }
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        instance.decrement_busy();
        if canceled {
            instance.marked_canceled = true;
        }

        match ended {
            Ok(Some(value)) => {
                instance.result = Some(value);
                self.try_complete(id);
            }
            Ok(None) => self.try_complete(id),
            Err(fault) => self.fault_instance(id, fault),
        }
    }

    fn on_bookmark_resumed(
        &mut self,
        id: InstanceId,
        activity: &Arc<Activity>,
        name: String,
        scope: BookmarkScope,
        callback: Callback,
        payload: Value,
    ) {
        self.tracker.emit(LifecycleEvent::BookmarkResumed {
            name,
            scope,
            owner: id,
        });

        if self.instances.get(id).map(ActivityInstance::state) != Some(InstanceState::Executing) {
            return;
        }
        let ActivityBody::ControlFlow(native) = activity.body().clone() else {
            self.fault_instance(
                id,
                Fault::protocol_violation("bookmark resumed on an activity that cannot own bookmarks"),
            );
            return;
        };

        let result = self.guarded(|exec| {
            let mut ctx = NativeActivityContext::new(exec, id);
            native.on_bookmark_resumed(&mut ctx, callback, payload)
        });
        match result {
            Ok(()) => self.try_complete(id),
            Err(fault) => self.fault_instance(id, fault),
        }
    }

    fn on_child_completed(&mut self, id: InstanceId, activity: &Arc<Activity>, completion: ChildCompletion) {
        let Some(parent) = self.instances.get_mut(id) else {
            return;
        };
        let callbacks = parent.detach_child(completion.instance);
        parent.decrement_busy();

        // A canceling parent only waits for its busy count to drain
        if parent.state == InstanceState::Executing
            && let (Some(callback), ActivityBody::ControlFlow(native)) =
                (callbacks.on_complete, activity.body().clone())
        {
            let result = self.guarded(|exec| {
                let mut ctx = NativeActivityContext::new(exec, id);
                native.on_child_completed(&mut ctx, callback, &completion)
            });
            if let Err(fault) = result {
                self.fault_instance(id, fault);
                return;
            }
        }

        self.try_complete(id);
    }

    fn on_child_faulted(&mut self, id: InstanceId, activity: &Arc<Activity>, child: InstanceId, fault: Fault) {
        let Some(parent) = self.instances.get_mut(id) else {
            return;
        };
        let callbacks = parent.detach_child(child);
        parent.decrement_busy();

        if parent.state == InstanceState::Executing
            && let (Some(callback), ActivityBody::ControlFlow(native)) =
                (callbacks.on_fault, activity.body().clone())
        {
            let handled = self.guarded(|exec| {
                let mut ctx = NativeActivityContext::new(exec, id);
                native.on_child_faulted(&mut ctx, callback, &fault)
            });
            match handled {
                Ok(()) => {
                    tracing::debug!(instance = %id, %child, "child fault absorbed");
                    self.try_complete(id);
                }
                Err(fault) => self.fault_instance(id, fault),
            }
            return;
        }

        self.fault_instance(id, fault);
    }

    /// Close the instance if nothing is outstanding
    fn try_complete(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        if !matches!(instance.state, InstanceState::Executing | InstanceState::Canceling) {
            return;
        }
        if instance.busy_count > 0 || self.bookmarks.owned_by(id) > 0 {
            return;
        }
        self.complete_instance(id, true);
    }

    /// Capture a fault on `id`, tear down what it still owns, and finish it
    fn fault_instance(&mut self, id: InstanceId, fault: Fault) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let fault = fault.originating_at(instance.activity.name(), id);
        tracing::warn!(instance = %id, activity = instance.activity.name(), %fault, "activity faulted");

        let children = instance.children.clone();
        for child in children {
            self.terminate_subtree(child, false);
        }
        self.release_operation(id);
        self.remove_bookmarks(id);

        if let Some(instance) = self.instances.get_mut(id) {
            instance.fault = Some(fault);
            instance.busy_count = 0;
        }
        self.complete_instance(id, true);
    }

    /// Remove a finished instance from the table and report to its parent
    ///
    /// With `notify_parent` unset the parent is detached from directly instead
    /// of receiving a work item (the parent is being torn down too).
    fn complete_instance(&mut self, id: InstanceId, notify_parent: bool) {
        let Some(mut instance) = self.instances.remove(id) else {
            return;
        };
        self.remove_bookmarks(id);

        let state = if instance.fault.is_some() {
            InstanceState::Faulted
        } else if instance.marked_canceled || (instance.cancel_requested && instance.result.is_none()) {
            InstanceState::Canceled
        } else {
            InstanceState::Closed
        };
        instance.state = state;
        let name = instance.activity.name().to_string();

        match &instance.fault {
            Some(fault) => self.tracker.emit(LifecycleEvent::InstanceFaulted {
                instance: id,
                activity: name.clone(),
                fault: fault.clone(),
            }),
            None => self.tracker.emit(LifecycleEvent::InstanceCompleted {
                instance: id,
                activity: name.clone(),
                state,
            }),
        }
        tracing::debug!(instance = %id, activity = %name, ?state, "instance finished");

        let Some(parent) = instance.parent else {
            self.finish_root(instance);
            return;
        };

        if !notify_parent {
            if let Some(parent) = self.instances.get_mut(parent) {
                parent.detach_child(id);
                parent.decrement_busy();
            }
            return;
        }

        if !self.instances.contains(parent) {
            return;
        }
        match instance.fault {
            Some(fault) => {
                self.enqueue_with_priority(
                    parent,
                    WorkAction::PropagateFault { child: id, fault },
                    Priority::High,
                );
            }
            None => {
                self.enqueue(
                    parent,
                    WorkAction::ChildCompleted(ChildCompletion {
                        instance: id,
                        activity: name,
                        state,
                        result: instance.result,
                    }),
                );
            }
        }
    }

    fn finish_root(&mut self, root: ActivityInstance) {
        let outcome = match (root.state, root.fault) {
            (_, Some(fault)) => Outcome::Faulted(fault),
            (InstanceState::Canceled, None) => Outcome::Canceled,
            (_, None) => Outcome::Completed(root.result),
        };
        tracing::info!(workflow = %self.workflow_id, ?outcome, "workflow finished");
        self.outcome = Some(outcome);
    }

    fn remove_bookmarks(&mut self, owner: InstanceId) {
        let removed = self.bookmarks.remove_all(&[owner]);
        if !removed.is_empty() {
            self.tracker.emit(LifecycleEvent::BookmarksRemoved {
                owner,
                count: removed.len(),
            });
        }
    }

    /// Schedule `child` under `parent`
    ///
    /// The parent must be executing and `child` must be one of the children
    /// its metadata declares.
    pub fn schedule_child(
        &mut self,
        parent: InstanceId,
        child: &Arc<Activity>,
        on_complete: Option<Callback>,
    ) -> ExecutorResult<InstanceId> {
        self.schedule_child_with(
            parent,
            child,
            ChildCallbacks {
                on_complete,
                on_fault: None,
            },
        )
    }

    pub(crate) fn schedule_child_with(
        &mut self,
        parent: InstanceId,
        child: &Arc<Activity>,
        callbacks: ChildCallbacks,
    ) -> ExecutorResult<InstanceId> {
        let owner = self
            .instances
            .get(parent)
            .ok_or(ExecutorError::InstanceNotFound(parent))?;
        if owner.state != InstanceState::Executing {
            return Err(ExecutorError::Protocol(format!(
                "instance {} cannot schedule children while {:?}",
                parent, owner.state
            )));
        }
        let declared = owner
            .activity
            .metadata()
            .children
            .iter()
            .any(|c| Arc::ptr_eq(c, child));
        if !declared {
            return Err(ExecutorError::Protocol(format!(
                "'{}' is not a declared child of '{}'",
                child.name(),
                owner.activity.name()
            )));
        }

        let id = self.ids.instance();
        self.instances
            .insert(ActivityInstance::new(id, child.clone(), Some(parent)));
        if let Some(owner) = self.instances.get_mut(parent) {
            owner.children.push(id);
            owner.child_callbacks.insert(id, callbacks);
            owner.increment_busy();
        }
        self.enqueue(id, WorkAction::Start);
        Ok(id)
    }

    pub(crate) fn create_bookmark(
        &mut self,
        owner: InstanceId,
        name: impl Into<String>,
        scope: BookmarkScope,
        callback: Callback,
    ) -> BookmarkResult<Bookmark> {
        let bookmark = self.bookmarks.register(name, scope, owner, callback)?;
        self.tracker.emit(LifecycleEvent::BookmarkCreated {
            name: bookmark.name.clone(),
            scope: bookmark.scope.clone(),
            owner,
        });
        Ok(bookmark)
    }

    /// Consume a bookmark and enqueue its resumption
    ///
    /// The resumption is processed by the next [`run_to_idle`](Self::run_to_idle).
    pub fn resume_bookmark(&mut self, name: &str, scope: &BookmarkScope, payload: Value) -> ResumeResult {
        let result = self
            .bookmarks
            .resume(name, scope, payload, &mut self.scheduler);
        match &result {
            ResumeResult::Resumed { owner } => {
                tracing::debug!(bookmark = name, %scope, %owner, "bookmark resumed");
                self.tracker.emit(LifecycleEvent::WorkItemScheduled {
                    seq: self.scheduler.clock(),
                    instance: *owner,
                    action: "resume-bookmark".to_string(),
                });
            }
            ResumeResult::NotFound => {
                tracing::debug!(bookmark = name, %scope, "no bookmark to resume");
            }
        }
        result
    }

    /// Cooperatively cancel `id` and its subtree
    ///
    /// Children are canceled before their parents. Each instance's
    /// cancellation hook runs at most once; instances with outstanding work
    /// stay `Canceling` until that work reports back.
    pub fn request_cancel(&mut self, id: InstanceId) -> ExecutorResult<()> {
        if !self.instances.contains(id) {
            return Err(ExecutorError::InstanceNotFound(id));
        }
        self.cancel_subtree(id);
        Ok(())
    }

    /// Cancel the whole tree
    pub fn cancel(&mut self) -> ExecutorResult<()> {
        let root = self.root.ok_or(ExecutorError::NotStarted)?;
        if self.outcome.is_some() {
            return Ok(());
        }
        self.request_cancel(root)
    }

    pub(crate) fn cancel_subtree(&mut self, id: InstanceId) {
        let order = self.instances.subtree(id);
        for target in order.into_iter().rev() {
            self.cancel_one(target);
        }
    }

    fn cancel_one(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if instance.state.is_terminal() || instance.cancel_requested {
            return;
        }
        instance.cancel_requested = true;

        if instance.state == InstanceState::Created {
            // Never started; its start item will find it gone
            self.complete_instance(id, true);
            return;
        }

        instance.state = InstanceState::Canceling;
        let body = instance.activity.body().clone();
        self.remove_bookmarks(id);
        tracing::debug!(instance = %id, "canceling");

        match body {
            ActivityBody::ControlFlow(native) => {
                if let Some(instance) = self.instances.get_mut(id)
                    && !instance.cancel_hook_invoked
                {
                    instance.cancel_hook_invoked = true;
                    self.run_native_cancel(id, native);
                }
            }
            ActivityBody::Async(leaf) => {
                if let Some(op) = self.pending_operations.get_mut(&id)
                    && !op.has_called_cancel
                {
                    op.has_called_cancel = true;
                    self.run_async_cancel(id, leaf);
                }
            }
            ActivityBody::Synchronous(_) => {}
        }

        self.try_complete(id);
    }

    fn run_native_cancel(&mut self, id: InstanceId, native: Arc<dyn NativeActivity>) {
        let result = self.guarded(|exec| {
            let mut ctx = NativeActivityContext::new(exec, id);
            native.cancel(&mut ctx);
            Ok(())
        });
        if let Err(fault) = result {
            tracing::warn!(instance = %id, %fault, "cancellation hook failed");
        }
    }

    fn run_async_cancel(&mut self, id: InstanceId, leaf: Arc<dyn AsyncCodeActivity>) {
        let result = self.guarded(|exec| {
            let mut ctx = AsyncCodeActivityContext::new(exec, id);
            leaf.cancel(&mut ctx);
            Ok(())
        });
        if let Err(fault) = result {
            tracing::warn!(instance = %id, %fault, "cancellation hook failed");
        }
    }

    /// Forcibly terminate `id` and its subtree
    ///
    /// Every instance ends `Canceled` before this returns. Pending operations
    /// get their cancellation hook (unless it already ran) and are then
    /// released immediately; a completion that arrives afterwards is
    /// discarded.
    pub fn request_abort(&mut self, id: InstanceId, reason: impl Into<String>) -> ExecutorResult<()> {
        if !self.instances.contains(id) {
            return Err(ExecutorError::InstanceNotFound(id));
        }
        let reason = reason.into();
        tracing::info!(instance = %id, %reason, "aborting");
        if Some(id) == self.root {
            self.abort_reason = Some(reason);
        }
        self.terminate_subtree(id, true);
        Ok(())
    }

    /// Abort the whole tree
    pub fn abort(&mut self, reason: impl Into<String>) -> ExecutorResult<()> {
        let root = self.root.ok_or(ExecutorError::NotStarted)?;
        if self.outcome.is_some() {
            return Ok(());
        }
        self.request_abort(root, reason)
    }

    fn terminate_subtree(&mut self, id: InstanceId, notify_parent: bool) {
        let order = self.instances.subtree(id);
        for target in order.into_iter().rev() {
            self.terminate_one(target, notify_parent && target == id);
        }
    }

    fn terminate_one(&mut self, id: InstanceId, notify_parent: bool) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if instance.state.is_terminal() {
            return;
        }
        instance.cancel_requested = true;
        instance.marked_canceled = true;
        let run_native_hook = instance.state != InstanceState::Created && !instance.cancel_hook_invoked;
        if instance.state == InstanceState::Executing {
            instance.state = InstanceState::Canceling;
        }
        let body = instance.activity.body().clone();
        self.remove_bookmarks(id);

        match body {
            ActivityBody::ControlFlow(native) if run_native_hook => {
                if let Some(instance) = self.instances.get_mut(id) {
                    instance.cancel_hook_invoked = true;
                }
                self.run_native_cancel(id, native);
            }
            ActivityBody::Async(leaf) => {
                if let Some(op) = self.pending_operations.get_mut(&id)
                    && !op.has_called_cancel
                {
                    op.has_called_cancel = true;
                    op.is_aborting = true;
                    self.run_async_cancel(id, leaf);
                }
                self.force_release(id);
            }
            _ => {}
        }

        if let Some(instance) = self.instances.get_mut(id) {
            instance.busy_count = 0;
        }
        self.complete_instance(id, notify_parent);
    }

    fn force_release(&mut self, id: InstanceId) {
        let Some(op) = self.pending_operations.remove(&id) else {
            return;
        };
        let operation = op.operation();
        if op.token.force_release() {
            tracing::debug!(instance = %id, %operation, "forced release of active operation");
            self.tracker
                .emit(LifecycleEvent::OperationForceReleased { operation, instance: id });
        } else {
            tracing::debug!(instance = %id, %operation, "operation already claimed; its completion will be discarded");
        }
    }

    /// Whether the subtree rooted at `id` has nothing left to do internally
    ///
    /// True when no work item is queued for the subtree and no instance in it
    /// waits on an async operation. Bookmarks awaiting an external resume do
    /// not count as busy. A finished or unknown instance is idle.
    pub fn is_idle(&self, id: InstanceId) -> bool {
        let subtree: BTreeSet<InstanceId> = self.instances.subtree(id).into_iter().collect();
        if self.scheduler.has_work_for(|target| subtree.contains(&target)) {
            return false;
        }
        !subtree.iter().any(|member| {
            self.instances
                .get(*member)
                .is_some_and(|instance| instance.async_busy() > 0)
        })
    }

    /// Serializable view of the tree for a persistence provider
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            workflow_id: self.workflow_id,
            root: self.root,
            clock: self.scheduler.clock(),
            instances: self
                .instances
                .iter()
                .map(|instance| InstanceSnapshot {
                    id: instance.id,
                    activity: instance.activity.name().to_string(),
                    parent: instance.parent,
                    state: instance.state,
                    busy_count: instance.busy_count,
                    arguments: instance.arguments.clone(),
                    variables: instance.variables.clone(),
                })
                .collect(),
            bookmarks: self.bookmarks.pending(),
            pending_operations: self
                .pending_operations
                .iter()
                .map(|(instance, op)| PendingOperationSnapshot {
                    instance: *instance,
                    operation: op.operation(),
                })
                .collect(),
            outcome: self.outcome.clone(),
        }
    }

    /// Compare every live instance's busy count against its listed children
    /// plus its pending operation; returns the number of mismatches
    pub(crate) fn check_busy_counts(&self) -> usize {
        let mut mismatches = 0;
        for instance in self.instances.iter() {
            if instance.state.is_terminal() {
                continue;
            }
            let pending = u32::from(self.pending_operations.contains_key(&instance.id));
            let expected = instance.children.len() as u32 + pending;
            if instance.busy_count != expected {
                mismatches += 1;
                tracing::warn!(
                    instance = %instance.id,
                    busy = instance.busy_count,
                    expected,
                    "busy count does not match outstanding work"
                );
                self.tracker.emit(LifecycleEvent::BusyCountMismatch {
                    instance: instance.id,
                    busy_count: instance.busy_count,
                    expected,
                });
            }
        }
        mismatches
    }
}

impl std::fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("workflow_id", &self.workflow_id)
            .field("root", &self.root)
            .field("instances", &self.instances.len())
            .field("queued", &self.scheduler.pending_count())
            .field("outcome", &self.outcome)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("activity panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("activity panicked: {}", message)
    } else {
        "activity panicked".to_string()
    }
}
