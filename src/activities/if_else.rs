//! Conditional branch

use std::sync::Arc;

use crate::runtime::activity::{Activity, InArgument, MetadataBuilder, NativeActivity};
use crate::runtime::context::NativeActivityContext;
use crate::runtime::error::ActivityResult;

const CONDITION: &str = "Condition";

/// Schedules `then` when the condition holds and `otherwise` when it does not
///
/// Either branch may be absent, in which case the instance simply closes.
pub struct If {
    condition: InArgument,
    then: Option<Arc<Activity>>,
    otherwise: Option<Arc<Activity>>,
}

impl If {
    /// Branch on a boolean argument
    pub fn new(condition: impl Into<InArgument>) -> Self {
        Self {
            condition: condition.into(),
            then: None,
            otherwise: None,
        }
    }

    /// Activity scheduled when the condition is true
    pub fn then(mut self, activity: Arc<Activity>) -> Self {
        self.then = Some(activity);
        self
    }

    /// Activity scheduled when the condition is false
    pub fn otherwise(mut self, activity: Arc<Activity>) -> Self {
        self.otherwise = Some(activity);
        self
    }

    /// Finish into a shareable definition
    pub fn into_activity(self, name: impl Into<String>) -> Arc<Activity> {
        Activity::native(name, self)
    }
}

impl NativeActivity for If {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        metadata.bind(CONDITION, Some(&self.condition), true);
        metadata.add_optional_child(self.then.as_ref());
        metadata.add_optional_child(self.otherwise.as_ref());
    }

    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult<()> {
        let branch = if ctx.bool_argument(CONDITION)? {
            self.then.as_ref()
        } else {
            self.otherwise.as_ref()
        };
        if let Some(branch) = branch {
            ctx.schedule_activity(branch, None)?;
        }
        Ok(())
    }
}
