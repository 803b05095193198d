//! Suspend until a bookmark is resumed

use serde_json::Value;
use std::sync::Arc;

use crate::runtime::activity::{Activity, Callback, MetadataBuilder, NativeActivity};
use crate::runtime::bookmark::BookmarkScope;
use crate::runtime::context::NativeActivityContext;
use crate::runtime::error::ActivityResult;

const ON_RESUMED: Callback = "on_resumed";

/// Registers a bookmark and completes with the resume payload
///
/// The payload becomes the instance's result and, when configured, is also
/// written to a variable declared by an ancestor.
pub struct WaitForBookmark {
    name: String,
    scope: BookmarkScope,
    store_in: Option<String>,
}

impl WaitForBookmark {
    /// Wait on `name` in the workflow scope
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: BookmarkScope::Workflow,
            store_in: None,
        }
    }

    /// Use a named scope instead of the workflow scope
    pub fn in_scope(mut self, scope: BookmarkScope) -> Self {
        self.scope = scope;
        self
    }

    /// Also assign the payload to `variable`
    pub fn store_in(mut self, variable: impl Into<String>) -> Self {
        self.store_in = Some(variable.into());
        self
    }

    /// Finish into a shareable definition
    pub fn into_activity(self, name: impl Into<String>) -> Arc<Activity> {
        Activity::native(name, self)
    }
}

impl NativeActivity for WaitForBookmark {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        if self.name.is_empty() {
            metadata.add_validation_error("bookmark name must not be empty");
        }
    }

    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult<()> {
        ctx.create_bookmark(self.name.clone(), self.scope.clone(), ON_RESUMED)?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _callback: Callback,
        payload: Value,
    ) -> ActivityResult<()> {
        if let Some(variable) = &self.store_in {
            ctx.set_variable(variable, payload.clone())?;
        }
        ctx.set_result(payload);
        Ok(())
    }
}
