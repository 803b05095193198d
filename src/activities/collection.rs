//! Collection membership test

use serde_json::Value;

use crate::runtime::activity::{CodeActivity, InArgument, MetadataBuilder};
use crate::runtime::context::CodeActivityContext;
use crate::runtime::error::{ActivityResult, Fault};

const COLLECTION: &str = "Collection";
const ITEM: &str = "Item";

/// Produces `true` when `Item` is an element of the `Collection` array
pub struct ExistsInCollection {
    collection: InArgument,
    item: InArgument,
}

impl ExistsInCollection {
    /// Test whether `item` is in `collection`
    pub fn new(collection: impl Into<InArgument>, item: impl Into<InArgument>) -> Self {
        Self {
            collection: collection.into(),
            item: item.into(),
        }
    }
}

impl CodeActivity for ExistsInCollection {
    fn cache_metadata(&self, metadata: &mut MetadataBuilder<'_>) {
        metadata.bind(COLLECTION, Some(&self.collection), true);
        metadata.bind(ITEM, Some(&self.item), true);
    }

    fn execute(&self, ctx: &mut CodeActivityContext<'_>) -> ActivityResult<Value> {
        let Some(collection) = ctx.require_argument(COLLECTION)?.as_array() else {
            return Err(Fault::new(format!(
                "'{}' requires a collection",
                ctx.activity_name()
            )));
        };
        let item = ctx.require_argument(ITEM)?;
        Ok(Value::Bool(collection.contains(item)))
    }
}
