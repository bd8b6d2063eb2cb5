use crate::dispatch::{ProviderCallback, ReplyCallback, RequestReplyManager};
use crate::error::ReplyError;
use crate::message::{Message, MessageType, Reply, RequestReplyId};
use std::sync::Arc;

/// Entry point for messages arriving from a transport.
///
/// Decodes the payload by message type and hands it to the
/// [`RequestReplyManager`]. Replies to inbound requests are routed back to
/// the requester and expire together with the request. A request carrying a
/// reply-to address installs a route to its sender that lives as long as
/// the request.
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<RequestReplyManager>,
}

impl Dispatcher {
    /// Dispatch through `manager`.
    pub fn new(manager: Arc<RequestReplyManager>) -> Self {
        Self { manager }
    }

    /// The manager receiving decoded payloads.
    pub fn manager(&self) -> &Arc<RequestReplyManager> {
        &self.manager
    }

    /// Handle one inbound message.
    ///
    /// Expired and undecodable messages are logged and dropped. An
    /// undecodable request is answered with a serialization error when its
    /// correlation id can still be recovered.
    pub fn message_arrived(&self, message: Message) {
        if message.is_expired() {
            tracing::warn!(
                message_id = %message.id(),
                message_type = message.message_type().as_str(),
                "Dropping expired inbound message"
            );
            return;
        }

        match message.message_type() {
            MessageType::Request => self.request_arrived(message),
            MessageType::Reply => match self.manager.message_factory().decode_reply(&message) {
                Ok(reply) => {
                    self.manager.handle_reply(reply);
                }
                Err(err) => {
                    tracing::warn!(message_id = %message.id(), error = %err, "Dropping undecodable reply");
                }
            },
            MessageType::OneWay => {
                match self.manager.message_factory().decode_one_way_request(&message) {
                    Ok(request) => self.manager.handle_one_way_request(
                        message.recipient(),
                        request,
                        message.expiry_date_ms(),
                    ),
                    Err(err) => {
                        tracing::warn!(
                            message_id = %message.id(),
                            error = %err,
                            "Dropping undecodable one-way request"
                        );
                    }
                }
            }
            other => {
                tracing::warn!(
                    message_id = %message.id(),
                    message_type = other.as_str(),
                    "Dropping message of unsupported type"
                );
            }
        }
    }

    fn request_arrived(&self, message: Message) {
        // The requester may be unknown here; its reply-to hint routes the reply.
        if let Some(reply_to) = message.reply_to() {
            tracing::trace!(sender = %message.sender(), %reply_to, "Installing reply route");
            self.manager.router().resolver().table().put_with_expiry(
                message.sender().clone(),
                reply_to.clone(),
                false,
                message.expiry_date_ms(),
                false,
            );
        }

        match self.manager.message_factory().decode_request(&message) {
            Ok(request) => {
                let callback = self.reply_callback(&message, request.request_reply_id.clone());
                self.manager.handle_request(
                    Box::new(callback),
                    message.recipient(),
                    request,
                    message.expiry_date_ms(),
                );
            }
            Err(err) => {
                tracing::warn!(message_id = %message.id(), error = %err, "Undecodable request");
                if let Some(request_reply_id) = recover_request_reply_id(&message) {
                    let callback = self.reply_callback(&message, request_reply_id.clone());
                    Box::new(callback).on_failure(ReplyError::from(err));
                }
            }
        }
    }

    fn reply_callback(&self, request: &Message, request_reply_id: RequestReplyId) -> ReplyCallback {
        let router = self.manager.router().clone();
        let factory = self.manager.message_factory().clone();
        let from = request.recipient().clone();
        let to = request.sender().clone();
        let expiry_date_ms = request.expiry_date_ms();

        ReplyCallback::new(request_reply_id, move |reply: Reply| {
            let request_reply_id = reply.request_reply_id.clone();
            let message = match factory.create_reply(&from, &to, &reply, expiry_date_ms) {
                Ok(message) => message,
                Err(err) => {
                    tracing::error!(%request_reply_id, error = %err, "Cannot encode reply");
                    return;
                }
            };
            if let Err(err) = router.route(message) {
                tracing::warn!(%request_reply_id, recipient = %to, error = %err, "Reply not routed");
            }
        })
    }
}

fn recover_request_reply_id(message: &Message) -> Option<RequestReplyId> {
    let value: serde_json::Value = serde_json::from_slice(message.payload()).ok()?;
    value
        .get("request_reply_id")?
        .as_str()
        .map(RequestReplyId::from)
}
