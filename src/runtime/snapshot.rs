//! Serializable view of a live tree
//!
//! This is what a persistence provider stores once the tree is idle. The
//! executor defines no storage format beyond these serde types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::bookmark::BookmarkKey;
use super::executor::Outcome;
use super::ids::{InstanceId, LogicalClock, OperationId, WorkflowId};
use super::instance::InstanceState;

/// One live instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance identity
    pub id: InstanceId,
    /// Activity display name
    pub activity: String,
    /// Parent instance
    pub parent: Option<InstanceId>,
    /// Lifecycle state
    pub state: InstanceState,
    /// Outstanding child and async work
    pub busy_count: u32,
    /// Resolved arguments
    pub arguments: BTreeMap<String, Value>,
    /// Instance-local variables
    pub variables: BTreeMap<String, Value>,
}

/// An async operation still awaiting completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperationSnapshot {
    /// Owning instance
    pub instance: InstanceId,
    /// Operation handle
    pub operation: OperationId,
}

/// Tree shape, variables, and pending suspension points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    /// Workflow identity
    pub workflow_id: WorkflowId,
    /// Root instance
    pub root: Option<InstanceId>,
    /// Last work-item clock value handed out
    pub clock: LogicalClock,
    /// Live instances in id order
    pub instances: Vec<InstanceSnapshot>,
    /// Bookmarks awaiting resumption
    pub bookmarks: Vec<BookmarkKey>,
    /// Async operations awaiting completion
    pub pending_operations: Vec<PendingOperationSnapshot>,
    /// Terminal outcome, once reached
    pub outcome: Option<Outcome>,
}

impl TreeSnapshot {
    /// Whether the tree only waits on external bookmark resumptions
    pub fn is_suspended_on_bookmarks(&self) -> bool {
        self.outcome.is_none() && self.pending_operations.is_empty() && !self.bookmarks.is_empty()
    }

    /// Look up an instance by id
    pub fn instance(&self, id: InstanceId) -> Option<&InstanceSnapshot> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Encode as pretty JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Decode from JSON
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bookmark::BookmarkScope;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_snapshot_survives_json() {
        let mut variables = BTreeMap::new();
        variables.insert("attempts".to_string(), json!(2));
        let snapshot = TreeSnapshot {
            workflow_id: WorkflowId::from_uuid(Uuid::nil()),
            root: Some(InstanceId(1)),
            clock: LogicalClock(9),
            instances: vec![InstanceSnapshot {
                id: InstanceId(1),
                activity: "approval".into(),
                parent: None,
                state: InstanceState::Executing,
                busy_count: 0,
                arguments: BTreeMap::new(),
                variables,
            }],
            bookmarks: vec![BookmarkKey {
                name: "approve".into(),
                scope: BookmarkScope::Workflow,
            }],
            pending_operations: Vec::new(),
            outcome: None,
        };

        let decoded = TreeSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
        assert!(decoded.is_suspended_on_bookmarks());
        assert_eq!(decoded.instance(InstanceId(1)).unwrap().variables["attempts"], json!(2));
    }
}
