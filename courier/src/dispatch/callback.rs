use crate::error::ReplyError;
use crate::message::{Reply, RequestReplyId};

/// Receives the outcome of one provider invocation.
///
/// Both methods consume the callback, so it resolves at most once.
pub trait ProviderCallback: Send {
    /// The method returned; `reply` carries its response values.
    fn on_success(self: Box<Self>, reply: Reply);

    /// The method could not be bound, panicked or rejected the call.
    fn on_failure(self: Box<Self>, error: ReplyError);
}

impl<F> ProviderCallback for F
where
    F: FnOnce(Result<Reply, ReplyError>) + Send,
{
    fn on_success(self: Box<Self>, reply: Reply) {
        (*self)(Ok(reply))
    }

    fn on_failure(self: Box<Self>, error: ReplyError) {
        (*self)(Err(error))
    }
}

/// Callback turning either outcome into a [`Reply`] for the requester.
pub struct ReplyCallback {
    request_reply_id: RequestReplyId,
    respond: Box<dyn FnOnce(Reply) + Send>,
}

impl ReplyCallback {
    /// Send every outcome for `request_reply_id` through `respond`.
    pub fn new(request_reply_id: RequestReplyId, respond: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            request_reply_id,
            respond: Box::new(respond),
        }
    }
}

impl ProviderCallback for ReplyCallback {
    fn on_success(self: Box<Self>, reply: Reply) {
        (self.respond)(reply)
    }

    fn on_failure(self: Box<Self>, error: ReplyError) {
        (self.respond)(Reply::failure(self.request_reply_id, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_failure_becomes_error_reply() {
        let (tx, rx) = mpsc::channel();
        let callback: Box<dyn ProviderCallback> =
            Box::new(ReplyCallback::new("x".into(), move |reply| tx.send(reply).unwrap()));
        callback.on_failure(ReplyError::method_invocation("unknown method"));

        let reply = rx.recv().unwrap();
        assert_eq!(reply.request_reply_id, RequestReplyId::new("x"));
        assert!(matches!(reply.error, Some(ReplyError::MethodInvocation { .. })));
    }

    #[test]
    fn test_closure_callback() {
        let (tx, rx) = mpsc::channel();
        let callback: Box<dyn ProviderCallback> =
            Box::new(move |outcome: Result<Reply, ReplyError>| tx.send(outcome).unwrap());
        callback.on_success(Reply::success("y".into(), vec![]));
        assert!(rx.recv().unwrap().is_ok());
    }
}
