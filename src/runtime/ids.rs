//! Identifiers for workflows, activity instances, and async operations
//!
//! Instance and operation identifiers are sequential within one executor so
//! that two runs driven by the same external inputs allocate the same ids.
//! Only the workflow identity is random.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one workflow (one executor owning one activity tree)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new random WorkflowId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Activity instance identifier, unique within one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Async operation identifier, unique within one executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Logical clock value ordering work items within one executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalClock(pub u64);

impl LogicalClock {
    /// Create a new logical clock at zero
    pub fn zero() -> Self {
        Self(0)
    }

    /// Get the next clock value
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// Monotonic allocator for the sequential identifiers above
#[derive(Debug, Default, Clone)]
pub(crate) struct IdAllocator {
    next_instance: u64,
    next_operation: u64,
}

impl IdAllocator {
    pub(crate) fn instance(&mut self) -> InstanceId {
        self.next_instance += 1;
        InstanceId(self.next_instance)
    }

    pub(crate) fn operation(&mut self) -> OperationId {
        self.next_operation += 1;
        OperationId(self.next_operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.instance(), InstanceId(1));
        assert_eq!(ids.instance(), InstanceId(2));
        assert_eq!(ids.operation(), OperationId(1));
    }

    #[test]
    fn test_clock_next() {
        let clock = LogicalClock::zero();
        assert!(clock.next() > clock);
        assert_eq!(clock.next().next(), LogicalClock(2));
    }
}
