use crate::error::ReplyError;
use crate::message::{Reply, RequestReplyId};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Party waiting for the reply to one request.
///
/// Both methods consume the caller, so at most one of them can ever run.
pub trait ReplyCaller: Send + Sync {
    /// The matching reply arrived.
    fn on_reply(self: Box<Self>, reply: Reply);

    /// The request failed: timeout, delivery failure or shutdown.
    fn on_error(self: Box<Self>, error: ReplyError);
}

/// Reply caller backed by a oneshot channel; pair of [`ReplyFuture`].
#[derive(Debug)]
pub struct FutureReplyCaller {
    sender: oneshot::Sender<Result<Reply, ReplyError>>,
}

impl ReplyCaller for FutureReplyCaller {
    fn on_reply(self: Box<Self>, reply: Reply) {
        if self.sender.send(Ok(reply)).is_err() {
            tracing::debug!("Reply future dropped before reply arrived");
        }
    }

    fn on_error(self: Box<Self>, error: ReplyError) {
        if self.sender.send(Err(error)).is_err() {
            tracing::debug!("Reply future dropped before failure arrived");
        }
    }
}

/// Resolves with the response values of a request, or its failure.
///
/// A reply carrying an error resolves to that error.
#[derive(Debug)]
pub struct ReplyFuture {
    request_reply_id: RequestReplyId,
    receiver: oneshot::Receiver<Result<Reply, ReplyError>>,
}

impl ReplyFuture {
    /// Create a future and the reply caller that completes it.
    pub fn new(request_reply_id: RequestReplyId) -> (Self, FutureReplyCaller) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                request_reply_id,
                receiver,
            },
            FutureReplyCaller { sender },
        )
    }

    /// Correlation id this future waits on.
    pub fn request_reply_id(&self) -> &RequestReplyId {
        &self.request_reply_id
    }

    /// Block the current thread until the outcome is known.
    ///
    /// The reply caller directory bounds the wait by the round-trip TTL.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait_blocking(self) -> Result<Vec<Value>, ReplyError> {
        Self::flatten(self.receiver.blocking_recv())
    }

    fn flatten(
        received: Result<Result<Reply, ReplyError>, oneshot::error::RecvError>,
    ) -> Result<Vec<Value>, ReplyError> {
        match received {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ReplyError::Shutdown),
        }
    }
}

impl Future for ReplyFuture {
    type Output = Result<Vec<Value>, ReplyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(Self::flatten)
    }
}

/// Reply caller running a closure with the outcome.
pub struct CallbackReplyCaller {
    callback: Box<dyn FnOnce(Result<Reply, ReplyError>) + Send + Sync>,
}

impl CallbackReplyCaller {
    /// Wrap `callback`.
    pub fn new(callback: impl FnOnce(Result<Reply, ReplyError>) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl ReplyCaller for CallbackReplyCaller {
    fn on_reply(self: Box<Self>, reply: Reply) {
        (self.callback)(Ok(reply));
    }

    fn on_error(self: Box<Self>, error: ReplyError) {
        (self.callback)(Err(error));
    }
}
