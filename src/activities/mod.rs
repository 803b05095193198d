//! Built-in activities
//!
//! `If` and `While` are control-flow activities built only on the public
//! scheduling contract. The rest are leaves: closure-backed synchronous code,
//! a collection membership test, a bookmark wait, and two async leaves.

pub mod bookmark;
pub mod code;
pub mod collection;
pub mod future;
pub mod if_else;
pub mod invoke;
pub mod while_loop;

pub use bookmark::WaitForBookmark;
pub use code::CodeFn;
pub use collection::ExistsInCollection;
pub use future::FutureActivity;
pub use if_else::If;
pub use invoke::InvokeMethod;
pub use while_loop::While;
