//! Condition-first loop

use serde_json::Value;
use std::sync::Arc;

use crate::runtime::activity::{Activity, Callback, ChildCompletion, MetadataBuilder, NativeActivity};
use crate::runtime::context::NativeActivityContext;
use crate::runtime::error::{ActivityResult, Fault};
use crate::runtime::instance::InstanceState;

const ON_CONDITION: Callback = "on_condition_complete";
const ON_BODY: Callback = "on_body_complete";

/// Alternates a boolean-producing condition child and a body child
///
/// The loop ends when the condition produces `false` or is canceled. Without
/// a body the condition is rescheduled directly; each reschedule goes through
/// the work queue, so other ready work runs in between.
#[derive(Default)]
pub struct While {
    condition: Option<Arc<Activity>>,
    body: Option<Arc<Activity>>,
    variables: Vec<(String, Value)>,
}

impl While {
    /// Loop while `condition` produces `true`
    pub fn new(condition: Arc<Activity>) -> Self {
        Self {
            condition: Some(condition),
            ..Self::default()
        }
    }

    /// Activity run on every iteration
    pub fn body(mut self, body: Arc<Activity>) -> Self {
        self.body = Some(body);
        self
    }

    /// Declare a loop-scoped variable visible to the condition and body
    pub fn variable(mut self, name: impl Into<String>, initial: Value) -> Self {
        self.variables.push((name.into(), initial));
        self
    }

    /// Finish into a shareable definition
    pub fn into_activity(self, name: impl Into<String>) -> Arc<Activity> {
        Activity::native(name, self)
    }

    fn schedule_condition(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult<()> {
        if let Some(condition) = &self.condition {
            ctx.schedule_activity(condition, Some(ON_CONDITION))?;
        }
        Ok(())
    }
}

impl NativeActivity for While {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        for (name, initial) in &self.variables {
            metadata.declare_variable(name.clone(), initial.clone());
        }
        metadata.add_optional_child(self.body.as_ref());
        match &self.condition {
            Some(condition) => metadata.add_child(condition),
            None => metadata.add_validation_error("a condition activity is required"),
        }
    }

    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult<()> {
        self.schedule_condition(ctx)
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        callback: Callback,
        completion: &ChildCompletion,
    ) -> ActivityResult<()> {
        match callback {
            ON_CONDITION => {
                if completion.state != InstanceState::Closed {
                    return Ok(());
                }
                let proceed = completion.result_bool().ok_or_else(|| {
                    Fault::new(format!("condition '{}' must produce a boolean", completion.activity))
                })?;
                if !proceed {
                    return Ok(());
                }
                match &self.body {
                    Some(body) => {
                        ctx.schedule_activity(body, Some(ON_BODY))?;
                        Ok(())
                    }
                    None => self.schedule_condition(ctx),
                }
            }
            ON_BODY => self.schedule_condition(ctx),
            other => Err(Fault::protocol_violation(format!("unknown callback '{}'", other))),
        }
    }
}
