use crate::error::TransmitError;
use crate::message::Message;
use std::sync::Arc;

/// Continuation run once the transport has handed the message off.
pub type SuccessAction = Box<dyn FnOnce() + Send>;

/// Continuation run once if the transport could not send the message.
pub type FailureAction = Box<dyn FnOnce(TransmitError) + Send>;

/// Transport-bound sender for one resolved address.
///
/// `transmit` must not block: it starts the send and later calls exactly one
/// of the two actions. `on_failure` reports transport failures only; a remote
/// that received the message but failed to process it answers with a reply.
pub trait MessagingStub: Send + Sync {
    /// Start sending `message`.
    fn transmit(&self, message: Arc<Message>, on_success: SuccessAction, on_failure: FailureAction);

    /// Whether the stub can still be used. Unusable stubs are replaced by the
    /// factory on the next lookup.
    fn is_usable(&self) -> bool {
        true
    }

    /// Release the underlying connection.
    fn close(&self) {}
}
