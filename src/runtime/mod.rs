//! Activity execution runtime
//!
//! The [`ActivityExecutor`] is the composition root: it owns the instance
//! tree, the work-item [`Scheduler`](scheduler::Scheduler), the
//! [`BookmarkManager`](bookmark::BookmarkManager), the pending async
//! operations, and the injected [`MethodRegistry`](methods::MethodRegistry).
//! [`WorkflowHost`](host::WorkflowHost) runs an executor on a tokio task.

use serde::{Deserialize, Serialize};

// Submodules
pub mod activity;
pub mod async_op;
pub mod bookmark;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod host;
pub mod ids;
pub mod instance;
pub mod methods;
pub mod scheduler;
pub mod snapshot;
pub mod tracking;

/// Default bound of the method-resolution cache
pub const DEFAULT_METHOD_CACHE_CAPACITY: usize = 500;

/// Configuration for an [`ActivityExecutor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of cached method resolutions
    pub method_cache_capacity: usize,

    /// Record every dispatched work item for replay fingerprints
    pub record_trace: bool,

    /// Maximum work items one `run_to_idle` call dispatches (`None` = unbounded)
    pub max_work_items_per_pass: Option<usize>,

    /// Enable debug consistency checks
    pub debug: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            method_cache_capacity: DEFAULT_METHOD_CACHE_CAPACITY,
            record_trace: true,
            max_work_items_per_pass: None,
            debug: false,
        }
    }
}

// Re-export commonly used types
pub use activity::{
    Activity, ActivityBody, AsyncCodeActivity, Callback, ChildCompletion, CodeActivity, InArgument,
    MetadataBuilder, NativeActivity,
};
pub use async_op::{AsyncResult, AsyncToken, CompletionInbox, OperationOutcome, OperationState};
pub use bookmark::{Bookmark, BookmarkScope, ResumeResult};
pub use context::{AsyncCodeActivityContext, CodeActivityContext, Environment, NativeActivityContext};
pub use error::{ActivityResult, ExecutorError, ExecutorResult, Fault, FaultKind};
pub use executor::{ActivityExecutor, Outcome, RunStatus};
pub use host::{HostHandle, WorkflowHost};
pub use ids::{InstanceId, OperationId, WorkflowId};
pub use instance::InstanceState;
pub use methods::MethodRegistry;
pub use snapshot::TreeSnapshot;
pub use tracking::{LifecycleEvent, LifecycleObserver, RecordingObserver};
