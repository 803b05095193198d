//! Deterministic work-item queue
//!
//! Work items are stamped with a logical clock at enqueue time and dispatched
//! in clock order within a priority lane. Anything produced while processing
//! item N therefore lands after everything that was already queued, which
//! gives breadth-first, replayable ordering.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::activity::{Callback, ChildCompletion};
use super::async_op::OperationOutcome;
use super::bookmark::BookmarkScope;
use super::error::Fault;
use super::ids::{InstanceId, LogicalClock, OperationId};

/// Dispatch lane of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Regular FIFO lane
    Normal,
    /// Dispatched before any normal item (fault propagation)
    High,
}

/// What a work item does to its target instance
#[derive(Debug, Clone)]
pub enum WorkAction {
    /// Run the instance's activity for the first time
    Start,
    /// Deliver a bookmark resumption
    ResumeBookmark {
        /// Bookmark name
        name: String,
        /// Bookmark scope
        scope: BookmarkScope,
        /// Callback registered with the bookmark
        callback: Callback,
        /// Resumption payload
        payload: Value,
    },
    /// Finish an async operation that reported back
    CompleteAsync {
        /// Operation being completed
        operation: OperationId,
        /// Reported outcome
        outcome: OperationOutcome,
    },
    /// Notify a parent that a child closed or was canceled
    ChildCompleted(ChildCompletion),
    /// Deliver a child's unhandled fault to its parent
    PropagateFault {
        /// Faulted child
        child: InstanceId,
        /// The fault
        fault: Fault,
    },
}

impl WorkAction {
    /// Stable label used in traces and logs
    pub fn label(&self) -> &'static str {
        match self {
            WorkAction::Start => "start",
            WorkAction::ResumeBookmark { .. } => "resume-bookmark",
            WorkAction::CompleteAsync { .. } => "complete-async-operation",
            WorkAction::ChildCompleted(_) => "child-completed",
            WorkAction::PropagateFault { .. } => "propagate-fault",
        }
    }
}

/// A queued unit of scheduler work
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Ordering key
    pub seq: LogicalClock,
    /// Dispatch lane
    pub priority: Priority,
    /// Target instance
    pub instance: InstanceId,
    /// Action to perform
    pub action: WorkAction,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.priority == other.priority
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher lane first, then reverse clock for a min-heap (earliest first)
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Work-item queue
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Ready queue (max-heap by priority, min-heap by clock)
    ready_queue: BinaryHeap<WorkItem>,

    /// Last clock value handed out
    clock: LogicalClock,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a normal-priority work item
    pub fn enqueue(&mut self, instance: InstanceId, action: WorkAction) -> LogicalClock {
        self.enqueue_with_priority(instance, action, Priority::Normal)
    }

    /// Enqueue a work item in the given lane
    pub fn enqueue_with_priority(
        &mut self,
        instance: InstanceId,
        action: WorkAction,
        priority: Priority,
    ) -> LogicalClock {
        let seq = self.clock.next();
        self.clock = seq;
        self.ready_queue.push(WorkItem {
            seq,
            priority,
            instance,
            action,
        });
        seq
    }

    /// Pop the next work item (if any)
    pub fn next_item(&mut self) -> Option<WorkItem> {
        self.ready_queue.pop()
    }

    /// Check if any work items are ready
    pub fn has_ready_items(&self) -> bool {
        !self.ready_queue.is_empty()
    }

    /// Get the number of pending work items
    pub fn pending_count(&self) -> usize {
        self.ready_queue.len()
    }

    /// Whether any queued item targets an instance matching `pred`
    pub fn has_work_for(&self, pred: impl Fn(InstanceId) -> bool) -> bool {
        self.ready_queue.iter().any(|item| pred(item.instance))
    }

    /// Last clock value handed out
    pub fn clock(&self) -> LogicalClock {
        self.clock
    }
}
