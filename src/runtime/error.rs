//! Error types for the Trellis runtime
//!
//! Domain errors use thiserror. Faults raised by activity code are plain values
//! (`Fault`) so they can be captured on an instance and propagated up the tree
//! without ever unwinding through the dispatch loop.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::bookmark::BookmarkScope;
use super::ids::InstanceId;

/// Top-level executor error surfaced to callers
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Metadata compilation reported problems; the tree was not started
    #[error("validation failed with {} error(s): {}", .0.len(), join_validation(.0))]
    Validation(Vec<ValidationError>),

    /// Bookmark-related errors
    #[error("Bookmark error: {0}")]
    Bookmark(#[from] BookmarkError),

    /// `start` was called on an executor that already owns a tree
    #[error("executor already started a root activity")]
    AlreadyStarted,

    /// An operation that needs a root instance was called before `start`
    #[error("executor has not been started")]
    NotStarted,

    /// Instance is not (or no longer) part of the tree
    #[error("Instance {0} not found")]
    InstanceNotFound(InstanceId),

    /// A request broke the executor contract (e.g. scheduling an undeclared child)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience result alias for executor operations
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// A metadata validation problem attached to one activity definition
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("activity '{activity}': {message}")]
pub struct ValidationError {
    /// Display name of the offending activity
    pub activity: String,
    /// Description of the problem
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for the named activity
    pub fn new(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            message: message.into(),
        }
    }
}

/// Bookmark registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookmarkError {
    /// A bookmark with the same (name, scope) identity is already registered
    #[error("Bookmark '{name}' already registered in scope {scope}")]
    Duplicate {
        /// Bookmark name
        name: String,
        /// Bookmark scope
        scope: BookmarkScope,
    },
}

/// Convenience result alias for bookmark operations
pub type BookmarkResult<T> = std::result::Result<T, BookmarkError>;

/// Classification of a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Raised explicitly by activity code
    User,
    /// An activity broke the executor contract (e.g. a mismatched operation handle)
    ProtocolViolation,
    /// Argument binding failed when the instance started
    Binding,
    /// Activity code panicked
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FaultKind::User => "user",
            FaultKind::ProtocolViolation => "protocol-violation",
            FaultKind::Binding => "binding",
            FaultKind::Panic => "panic",
        };
        f.write_str(label)
    }
}

/// Where a fault was first captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultOrigin {
    /// Display name of the activity that raised the fault
    pub activity: String,
    /// Instance that raised the fault
    pub instance: InstanceId,
}

/// An unhandled error raised by activity code
///
/// The executor stamps the origin the first time it captures a fault, so a
/// fault that travels to the root still names the activity it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} fault: {message}")]
pub struct Fault {
    /// Fault classification
    pub kind: FaultKind,
    /// Human-readable message
    pub message: String,
    /// Originating activity, filled in by the executor
    pub origin: Option<FaultOrigin>,
}

impl Fault {
    /// Create a user fault
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::User, message)
    }

    /// Create a protocol violation fault
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::ProtocolViolation, message)
    }

    /// Create an argument binding fault
    pub fn binding(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Binding, message)
    }

    pub(crate) fn panic(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Panic, message)
    }

    fn with_kind(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    /// Stamp the origin unless one is already recorded
    pub(crate) fn originating_at(mut self, activity: &str, instance: InstanceId) -> Self {
        if self.origin.is_none() {
            self.origin = Some(FaultOrigin {
                activity: activity.to_string(),
                instance,
            });
        }
        self
    }

    /// Whether this fault reports a contract violation
    pub fn is_protocol_violation(&self) -> bool {
        self.kind == FaultKind::ProtocolViolation
    }
}

impl From<BookmarkError> for Fault {
    fn from(err: BookmarkError) -> Self {
        Fault::new(err.to_string())
    }
}

/// Result type returned by activity code
pub type ActivityResult<T> = std::result::Result<T, Fault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_is_stamped_once() {
        let fault = Fault::new("boom")
            .originating_at("leaf", InstanceId(3))
            .originating_at("parent", InstanceId(1));

        let origin = fault.origin.unwrap();
        assert_eq!(origin.activity, "leaf");
        assert_eq!(origin.instance, InstanceId(3));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ExecutorError::Validation(vec![
            ValidationError::new("While", "condition is required"),
            ValidationError::new("If", "argument 'Condition' is required"),
        ]);
        let text = err.to_string();
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("condition is required"));
    }

    #[test]
    fn test_bookmark_error_converts_to_fault() {
        let err = BookmarkError::Duplicate {
            name: "approve".into(),
            scope: BookmarkScope::Workflow,
        };
        let fault: Fault = err.into();
        assert_eq!(fault.kind, FaultKind::User);
        assert!(fault.message.contains("approve"));
    }
}
