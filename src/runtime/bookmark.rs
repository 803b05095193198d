//! Bookmarks: named suspension points
//!
//! A bookmark is identified by (name, scope) and owned by one instance. It is
//! consumed exactly once: resuming removes the entry in the same step as the
//! lookup, and cancel/abort of the owner drops it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::activity::Callback;
use super::error::{BookmarkError, BookmarkResult};
use super::ids::InstanceId;
use super::scheduler::{Scheduler, WorkAction};

/// Scope a bookmark name is unique within
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookmarkScope {
    /// Workflow-wide scope
    Workflow,
    /// Named sub-scope
    Named(String),
}

impl BookmarkScope {
    /// Create a named scope
    pub fn named(name: impl Into<String>) -> Self {
        BookmarkScope::Named(name.into())
    }
}

impl Default for BookmarkScope {
    fn default() -> Self {
        BookmarkScope::Workflow
    }
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkScope::Workflow => f.write_str("workflow"),
            BookmarkScope::Named(name) => write!(f, "'{}'", name),
        }
    }
}

/// Bookmark identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookmarkKey {
    /// Bookmark name
    pub name: String,
    /// Bookmark scope
    pub scope: BookmarkScope,
}

/// A registered suspension point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookmark {
    /// Bookmark name
    pub name: String,
    /// Bookmark scope
    pub scope: BookmarkScope,
    /// Owning instance
    pub owner: InstanceId,
    /// Callback invoked on the owner when resumed
    pub callback: Callback,
}

impl Bookmark {
    /// Identity of this bookmark
    pub fn key(&self) -> BookmarkKey {
        BookmarkKey {
            name: self.name.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Outcome of a resume request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeResult {
    /// The bookmark existed; a resume work item was enqueued for its owner
    Resumed {
        /// Owning instance
        owner: InstanceId,
    },
    /// No bookmark with that identity is registered
    NotFound,
}

impl ResumeResult {
    /// Whether the bookmark was found
    pub fn is_found(&self) -> bool {
        matches!(self, ResumeResult::Resumed { .. })
    }
}

/// Name-to-callback table of live bookmarks
#[derive(Debug, Default)]
pub struct BookmarkManager {
    bookmarks: BTreeMap<BookmarkKey, Bookmark>,
}

impl BookmarkManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bookmark for `owner`
    pub fn register(
        &mut self,
        name: impl Into<String>,
        scope: BookmarkScope,
        owner: InstanceId,
        callback: Callback,
    ) -> BookmarkResult<Bookmark> {
        let bookmark = Bookmark {
            name: name.into(),
            scope,
            owner,
            callback,
        };
        let key = bookmark.key();
        if self.bookmarks.contains_key(&key) {
            return Err(BookmarkError::Duplicate {
                name: key.name,
                scope: key.scope,
            });
        }
        self.bookmarks.insert(key, bookmark.clone());
        Ok(bookmark)
    }

    /// Remove the bookmark and enqueue a resume work item for its owner
    pub fn resume(
        &mut self,
        name: &str,
        scope: &BookmarkScope,
        payload: Value,
        scheduler: &mut Scheduler,
    ) -> ResumeResult {
        let key = BookmarkKey {
            name: name.to_string(),
            scope: scope.clone(),
        };
        let Some(bookmark) = self.bookmarks.remove(&key) else {
            return ResumeResult::NotFound;
        };

        scheduler.enqueue(
            bookmark.owner,
            WorkAction::ResumeBookmark {
                name: bookmark.name,
                scope: bookmark.scope,
                callback: bookmark.callback,
                payload,
            },
        );
        ResumeResult::Resumed {
            owner: bookmark.owner,
        }
    }

    /// Drop every bookmark owned by one of `owners`
    pub fn remove_all(&mut self, owners: &[InstanceId]) -> Vec<Bookmark> {
        let doomed: Vec<BookmarkKey> = self
            .bookmarks
            .values()
            .filter(|b| owners.contains(&b.owner))
            .map(Bookmark::key)
            .collect();

        doomed
            .into_iter()
            .filter_map(|key| self.bookmarks.remove(&key))
            .collect()
    }

    /// Number of bookmarks owned by `owner`
    pub fn owned_by(&self, owner: InstanceId) -> usize {
        self.bookmarks.values().filter(|b| b.owner == owner).count()
    }

    /// Look up a bookmark without consuming it
    pub fn get(&self, name: &str, scope: &BookmarkScope) -> Option<&Bookmark> {
        self.bookmarks.get(&BookmarkKey {
            name: name.to_string(),
            scope: scope.clone(),
        })
    }

    /// Identities of all live bookmarks, in key order
    pub fn pending(&self) -> Vec<BookmarkKey> {
        self.bookmarks.keys().cloned().collect()
    }

    /// Number of live bookmarks
    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    /// Whether no bookmarks are live
    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }
}
