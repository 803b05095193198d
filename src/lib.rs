//! Trellis – a workflow activity execution engine
//!
//! This crate runs a tree of composable activities to completion:
//! - A deterministic, replayable work-item queue drained by a single logical thread
//! - Named bookmarks that let an instance suspend indefinitely and resume by name
//! - Per-instance busy counts that tell a persistence layer when a tree is quiescent
//! - An exactly-once bridge for async completions reported from arbitrary threads
//! - Cooperative cancellation and unconditional abort with forced release
//! - Built-in control-flow activities (`If`, `While`) and async leaves

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core: executor, scheduler, bookmarks, instances, and the async bridge
pub mod runtime;

/// Built-in activities exercising the scheduler contract
pub mod activities;

// Re-export key types for convenience
pub use runtime::{ActivityExecutor, ExecutorConfig};

/// Current version of the Trellis runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
