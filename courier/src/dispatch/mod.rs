//! Provider-side dispatch and the request/reply manager.
//!
//! Providers describe their callable methods once, in a [`MethodTable`]
//! built at registration time. The [`RequestInterpreter`] binds inbound
//! requests to those methods, and the [`RequestReplyManager`] ties the
//! caller side (send and correlate) to the provider side (queue, invoke,
//! answer).

mod callback;
mod dispatcher;
mod interpreter;
mod manager;
mod method;
mod provider;

pub use callback::{ProviderCallback, ReplyCallback};
pub use dispatcher::Dispatcher;
pub use interpreter::RequestInterpreter;
pub use manager::RequestReplyManager;
pub use method::{MethodFuture, MethodSignature, MethodTable, MethodTableBuilder};
pub use provider::{Provider, RequestCaller, RequestCallerDirectory, RequestCallerListener};
