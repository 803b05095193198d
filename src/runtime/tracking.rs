//! Lifecycle hooks and the replay trace
//!
//! Observers receive lifecycle events as call-outs. A failing or panicking
//! observer is logged and otherwise ignored.
//!
//! The execution trace records every dispatched work item. Its blake3 digest
//! is a fingerprint of the run: two runs fed the same external resumptions in
//! the same order produce the same digest.

use blake3::Hasher;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::bookmark::BookmarkScope;
use super::error::Fault;
use super::ids::{InstanceId, LogicalClock, OperationId};
use super::instance::InstanceState;

/// Lifecycle notification emitted by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// An instance's start work item ran
    InstanceStarted {
        /// Instance
        instance: InstanceId,
        /// Activity display name
        activity: String,
    },
    /// An instance reached `Closed` or `Canceled`
    InstanceCompleted {
        /// Instance
        instance: InstanceId,
        /// Activity display name
        activity: String,
        /// Terminal state
        state: InstanceState,
    },
    /// An instance reached `Faulted`
    InstanceFaulted {
        /// Instance
        instance: InstanceId,
        /// Activity display name
        activity: String,
        /// The fault
        fault: Fault,
    },
    /// A work item was enqueued
    WorkItemScheduled {
        /// Ordering key
        seq: LogicalClock,
        /// Target instance
        instance: InstanceId,
        /// Action label
        action: String,
    },
    /// A work item finished dispatching
    WorkItemCompleted {
        /// Ordering key
        seq: LogicalClock,
        /// Target instance
        instance: InstanceId,
        /// Action label
        action: String,
    },
    /// A bookmark was registered
    BookmarkCreated {
        /// Bookmark name
        name: String,
        /// Bookmark scope
        scope: BookmarkScope,
        /// Owning instance
        owner: InstanceId,
    },
    /// A bookmark was consumed by a resume
    BookmarkResumed {
        /// Bookmark name
        name: String,
        /// Bookmark scope
        scope: BookmarkScope,
        /// Owning instance
        owner: InstanceId,
    },
    /// Bookmarks were dropped because their owner was canceled or torn down
    BookmarksRemoved {
        /// Owning instance
        owner: InstanceId,
        /// Number removed
        count: usize,
    },
    /// An async operation began
    OperationBegun {
        /// Operation
        operation: OperationId,
        /// Owning instance
        instance: InstanceId,
    },
    /// An async operation's completion was processed
    OperationCompleted {
        /// Operation
        operation: OperationId,
        /// Owning instance
        instance: InstanceId,
    },
    /// Abort released an operation that never reported back
    OperationForceReleased {
        /// Operation
        operation: OperationId,
        /// Owning instance
        instance: InstanceId,
    },
    /// A completion arrived for an operation that is no longer pending
    CompletionDiscarded {
        /// Operation
        operation: OperationId,
        /// Owning instance
        instance: InstanceId,
    },
    /// Debug check: an instance's busy count disagrees with its live children
    /// plus pending operation
    BusyCountMismatch {
        /// Instance
        instance: InstanceId,
        /// Recorded busy count
        busy_count: u32,
        /// Outstanding work actually found
        expected: u32,
    },
}

/// Receiver of lifecycle call-outs
pub trait LifecycleObserver: Send {
    /// Handle an event
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// Observer that keeps every event in order
///
/// Clones share the same buffer, so a test can keep one handle and give the
/// other to the executor.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingObserver {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events recorded so far
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `pred`
    pub fn count(&self, pred: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// One dispatched work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Ordering key
    pub seq: LogicalClock,
    /// Target instance
    pub instance: InstanceId,
    /// Activity display name of the target
    pub activity: String,
    /// Action label
    pub action: String,
    /// Debug timestamp (not part of the digest)
    pub timestamp: DateTime<Utc>,
}

/// Ordered record of dispatched work items
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    /// Create an empty trace
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, seq: LogicalClock, instance: InstanceId, activity: &str, action: &str) {
        self.entries.push(TraceEntry {
            seq,
            instance,
            activity: activity.to_string(),
            action: action.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Recorded entries
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Number of dispatched work items
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was dispatched
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(activity, action)` pairs in dispatch order
    pub fn steps(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.activity.clone(), e.action.clone()))
            .collect()
    }

    /// Number of start work items dispatched for the named activity
    pub fn starts_of(&self, activity: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.activity == activity && e.action == "start")
            .count()
    }

    /// Deterministic fingerprint of the dispatch sequence
    pub fn digest(&self) -> String {
        let mut hasher = Hasher::new();
        for entry in &self.entries {
            hasher.update(&entry.seq.0.to_le_bytes());
            hasher.update(&entry.instance.0.to_le_bytes());
            hasher.update(entry.activity.as_bytes());
            hasher.update(&[0]);
            hasher.update(entry.action.as_bytes());
            hasher.update(&[0]);
        }
        format!("trace_{}", hasher.finalize().to_hex())
    }
}

/// Fan-out of lifecycle events plus the optional trace
#[derive(Default)]
pub(crate) struct Tracker {
    observers: Vec<Box<dyn LifecycleObserver>>,
    trace: Option<ExecutionTrace>,
}

impl Tracker {
    pub(crate) fn new(record_trace: bool) -> Self {
        Self {
            observers: Vec::new(),
            trace: record_trace.then(ExecutionTrace::new),
        }
    }

    pub(crate) fn add_observer(&mut self, observer: Box<dyn LifecycleObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        for observer in &self.observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "lifecycle observer failed");
                }
                Err(_) => {
                    tracing::warn!("lifecycle observer panicked");
                }
            }
        }
    }

    pub(crate) fn record(&mut self, seq: LogicalClock, instance: InstanceId, activity: &str, action: &str) {
        if let Some(trace) = self.trace.as_mut() {
            trace.record(seq, instance, activity, action);
        }
    }

    pub(crate) fn trace(&self) -> Option<&ExecutionTrace> {
        self.trace.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingObserver;

    impl LifecycleObserver for FailingObserver {
        fn on_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    struct PanickingObserver;

    impl LifecycleObserver for PanickingObserver {
        fn on_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
            panic!("observer bug")
        }
    }

    fn started(id: u64) -> LifecycleEvent {
        LifecycleEvent::InstanceStarted {
            instance: InstanceId(id),
            activity: "leaf".into(),
        }
    }

    #[test]
    fn test_failing_observers_do_not_stop_fan_out() {
        let recorder = RecordingObserver::new();
        let mut tracker = Tracker::new(false);
        tracker.add_observer(Box::new(FailingObserver));
        tracker.add_observer(Box::new(PanickingObserver));
        tracker.add_observer(Box::new(recorder.clone()));

        tracker.emit(started(1));
        tracker.emit(started(2));

        assert_eq!(recorder.events(), vec![started(1), started(2)]);
    }

    #[test]
    fn test_digest_ignores_timestamps() {
        let mut a = ExecutionTrace::new();
        let mut b = ExecutionTrace::new();
        a.record(LogicalClock(1), InstanceId(1), "root", "start");
        std::thread::sleep(std::time::Duration::from_millis(2));
        b.record(LogicalClock(1), InstanceId(1), "root", "start");

        assert_eq!(a.digest(), b.digest());

        b.record(LogicalClock(2), InstanceId(2), "child", "start");
        assert_ne!(a.digest(), b.digest());
        assert_eq!(b.starts_of("child"), 1);
    }

    #[test]
    fn test_trace_disabled() {
        let mut tracker = Tracker::new(false);
        tracker.record(LogicalClock(1), InstanceId(1), "root", "start");
        assert!(tracker.trace().is_none());
    }
}
