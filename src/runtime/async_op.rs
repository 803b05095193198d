//! Async operation bridge
//!
//! An [`AsyncToken`] is the only piece of executor state that may cross
//! threads. Reporting through it performs a compare-and-set on the operation
//! state; exactly one report wins and becomes one inbound completion, which
//! the dispatch loop turns into one `CompleteAsync` work item.
//!
//! State machine (one atomic byte):
//!
//! ```text
//! Active ──report──▶ Completing   (external completion claimed, queued)
//!   │ ──inline────▶ Completed    (begin finished synchronously)
//!   └ ──release───▶ Canceled     (begin failed or abort forced release)
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;

use super::error::{ActivityResult, Fault};
use super::ids::{InstanceId, OperationId};

const ACTIVE: u8 = 0;
const COMPLETING: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELED: u8 = 3;

/// Observable state of an async operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    /// Begun and not yet resolved
    Active,
    /// An external completion claimed the operation and is queued
    Completing,
    /// Resolved synchronously inside `begin`
    Completed,
    /// Released without completion (begin failure or forced abort)
    Canceled,
}

impl OperationState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            ACTIVE => OperationState::Active,
            COMPLETING => OperationState::Completing,
            COMPLETED => OperationState::Completed,
            _ => OperationState::Canceled,
        }
    }
}

/// How an external operation resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationOutcome {
    /// Produced a value
    Completed(Value),
    /// Failed
    Failed(Fault),
    /// Acknowledged a cancellation request
    Canceled,
}

impl From<ActivityResult<Value>> for OperationOutcome {
    fn from(result: ActivityResult<Value>) -> Self {
        match result {
            Ok(value) => OperationOutcome::Completed(value),
            Err(fault) => OperationOutcome::Failed(fault),
        }
    }
}

/// What `begin` hands back to the executor
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncResult {
    /// The operation is in flight; completion will arrive through the token
    Pending {
        /// Operation handle
        operation: OperationId,
    },
    /// The operation finished before `begin` returned
    Completed {
        /// Operation handle
        operation: OperationId,
        /// Outcome
        outcome: OperationOutcome,
    },
}

impl AsyncResult {
    /// Operation handle carried by this result
    pub fn operation(&self) -> OperationId {
        match self {
            AsyncResult::Pending { operation } | AsyncResult::Completed { operation, .. } => {
                *operation
            }
        }
    }
}

/// A completion that won the race and waits to be dispatched
#[derive(Debug, Clone)]
pub struct InboundCompletion {
    /// Completed operation
    pub operation: OperationId,
    /// Owning instance
    pub instance: InstanceId,
    /// Reported outcome
    pub outcome: OperationOutcome,
}

/// Cross-thread hand-off between tokens and the dispatch loop
#[derive(Debug, Default)]
pub struct CompletionInbox {
    queue: Mutex<VecDeque<InboundCompletion>>,
    notify: Notify,
}

impl CompletionInbox {
    /// Create an empty inbox
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, completion: InboundCompletion) {
        self.queue.lock().push_back(completion);
        self.notify.notify_one();
    }

    /// Take everything queued so far, in arrival order
    pub fn drain(&self) -> Vec<InboundCompletion> {
        self.queue.lock().drain(..).collect()
    }

    /// Number of queued completions
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Wait until a completion is pushed
    ///
    /// A push that happens before the wait starts is not lost.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct OperationShared {
    operation: OperationId,
    instance: InstanceId,
    state: AtomicU8,
    inbox: Arc<CompletionInbox>,
}

/// Correlation token for one async operation
///
/// Cheap to clone and safe to send to any thread. Only the first report wins.
#[derive(Debug, Clone)]
pub struct AsyncToken {
    shared: Arc<OperationShared>,
}

impl AsyncToken {
    pub(crate) fn new(operation: OperationId, instance: InstanceId, inbox: Arc<CompletionInbox>) -> Self {
        Self {
            shared: Arc::new(OperationShared {
                operation,
                instance,
                state: AtomicU8::new(ACTIVE),
                inbox,
            }),
        }
    }

    /// Operation handle
    pub fn operation(&self) -> OperationId {
        self.shared.operation
    }

    /// Instance that began the operation
    pub fn instance(&self) -> InstanceId {
        self.shared.instance
    }

    /// Current state
    pub fn state(&self) -> OperationState {
        OperationState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether nobody has claimed or released the operation yet
    pub fn is_still_active(&self) -> bool {
        self.state() == OperationState::Active
    }

    /// Report the operation's result; returns `true` if this call won
    pub fn report_completion(&self, result: ActivityResult<Value>) -> bool {
        self.report(result.into())
    }

    /// Acknowledge cancellation; returns `true` if this call won
    pub fn report_canceled(&self) -> bool {
        self.report(OperationOutcome::Canceled)
    }

    /// Report an outcome; returns `true` if this call won
    pub fn report(&self, outcome: OperationOutcome) -> bool {
        if !self.transition(COMPLETING) {
            tracing::debug!(
                operation = %self.shared.operation,
                state = ?self.state(),
                "ignoring completion report for resolved operation"
            );
            return false;
        }

        self.shared.inbox.push(InboundCompletion {
            operation: self.shared.operation,
            instance: self.shared.instance,
            outcome,
        });
        true
    }

    /// Handle for an operation that will complete later
    pub fn pending(&self) -> AsyncResult {
        AsyncResult::Pending {
            operation: self.shared.operation,
        }
    }

    /// Handle for an operation that finished inside `begin`
    pub fn completed(&self, outcome: impl Into<OperationOutcome>) -> AsyncResult {
        AsyncResult::Completed {
            operation: self.shared.operation,
            outcome: outcome.into(),
        }
    }

    pub(crate) fn complete_inline(&self) -> bool {
        self.transition(COMPLETED)
    }

    pub(crate) fn force_release(&self) -> bool {
        self.transition(CANCELED)
    }

    fn transition(&self, to: u8) -> bool {
        self.shared
            .state
            .compare_exchange(ACTIVE, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Executor-side record of one pending async operation
#[derive(Debug)]
pub struct AsyncOperationContext {
    pub(crate) token: AsyncToken,
    pub(crate) has_called_cancel: bool,
    pub(crate) is_aborting: bool,
    pub(crate) user_state: Option<Value>,
}

impl AsyncOperationContext {
    pub(crate) fn new(token: AsyncToken) -> Self {
        Self {
            token,
            has_called_cancel: false,
            is_aborting: false,
            user_state: None,
        }
    }

    /// Operation handle
    pub fn operation(&self) -> OperationId {
        self.token.operation()
    }

    /// Whether nobody has claimed or released the operation yet
    pub fn is_still_active(&self) -> bool {
        self.token.is_still_active()
    }

    /// Whether the cancellation hook already ran
    pub fn has_called_cancel(&self) -> bool {
        self.has_called_cancel
    }

    /// Whether the operation is being torn down by abort
    pub fn is_aborting(&self) -> bool {
        self.is_aborting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;

    fn token(inbox: &Arc<CompletionInbox>) -> AsyncToken {
        AsyncToken::new(OperationId(1), InstanceId(7), inbox.clone())
    }

    #[test]
    fn test_first_report_wins() {
        let inbox = Arc::new(CompletionInbox::new());
        let token = token(&inbox);

        assert!(token.report_completion(Ok(json!(1))));
        assert!(!token.report_completion(Ok(json!(2))));
        assert!(!token.report_canceled());

        let drained = inbox.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].outcome, OperationOutcome::Completed(json!(1)));
        assert_eq!(token.state(), OperationState::Completing);
    }

    #[test]
    fn test_forced_release_blocks_late_report() {
        let inbox = Arc::new(CompletionInbox::new());
        let token = token(&inbox);

        assert!(token.force_release());
        assert!(!token.report_completion(Ok(json!("late"))));
        assert!(inbox.is_empty());
        assert_eq!(token.state(), OperationState::Canceled);
    }

    #[test]
    fn test_report_beats_forced_release() {
        let inbox = Arc::new(CompletionInbox::new());
        let token = token(&inbox);

        assert!(token.report_canceled());
        assert!(!token.force_release());
        assert!(!token.complete_inline());
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn test_concurrent_reports_enqueue_exactly_one() {
        let inbox = Arc::new(CompletionInbox::new());
        let token = token(&inbox);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let token = token.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    token.report_completion(Ok(json!(i)))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(inbox.drain().len(), 1);
    }

    #[test]
    fn test_result_operation_handle() {
        let inbox = Arc::new(CompletionInbox::new());
        let token = token(&inbox);
        assert_eq!(token.pending().operation(), OperationId(1));
        assert_eq!(
            token.completed(OperationOutcome::Canceled).operation(),
            OperationId(1)
        );
    }
}
