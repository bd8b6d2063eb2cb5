//! Reply correlation.
//!
//! A caller registers a [`ReplyCaller`] under its request's correlation id.
//! The [`ReplyCallerDirectory`] hands it either the matching reply or a
//! timeout error, whichever comes first, and never both.

mod caller;
mod directory;

pub use caller::{CallbackReplyCaller, FutureReplyCaller, ReplyCaller, ReplyFuture};
pub use directory::ReplyCallerDirectory;
