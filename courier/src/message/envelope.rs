//! Message envelope.
//!
//! A [`Message`] is immutable once built. The mutable pre-wire form is the
//! [`MessageBuilder`], which also converts relative TTLs into an absolute
//! expiry date so that every accepted message carries a fixed deadline.

use crate::message::{Address, MessageId, ParticipantId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Kind of payload an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Request expecting a reply.
    Request,
    /// Reply to a request.
    Reply,
    /// Fire-and-forget request.
    OneWay,
    /// Subscription registration.
    SubscriptionRequest,
    /// Reply to a subscription registration.
    SubscriptionReply,
    /// Subscription cancellation.
    SubscriptionStop,
    /// Publication to a subscriber.
    Publication,
    /// Multicast publication.
    Multicast,
}

impl MessageType {
    /// Name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Reply => "reply",
            MessageType::OneWay => "one_way",
            MessageType::SubscriptionRequest => "subscription_request",
            MessageType::SubscriptionReply => "subscription_reply",
            MessageType::SubscriptionStop => "subscription_stop",
            MessageType::Publication => "publication",
            MessageType::Multicast => "multicast",
        }
    }

    /// Whether the sender waits for an answer to this message.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            MessageType::Request | MessageType::SubscriptionRequest
        )
    }

    /// Whether this message answers a request.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Reply | MessageType::SubscriptionReply)
    }

    /// Messages that are pointless to retry when the recipient is unknown.
    pub(crate) fn discard_if_unroutable(&self) -> bool {
        matches!(
            self,
            MessageType::Reply
                | MessageType::SubscriptionReply
                | MessageType::Publication
                | MessageType::Multicast
        )
    }
}

/// Time-to-live of a message under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Relative to the moment the message is built.
    Relative(Duration),
    /// Absolute expiry date in epoch milliseconds.
    Absolute(u64),
}

/// An immutable message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    message_type: MessageType,
    sender: ParticipantId,
    recipient: ParticipantId,
    expiry_date_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    custom_headers: HashMap<String, String>,
    payload: Vec<u8>,
}

impl Message {
    /// Unique message identifier.
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Payload kind.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Sending participant.
    pub fn sender(&self) -> &ParticipantId {
        &self.sender
    }

    /// Receiving participant.
    pub fn recipient(&self) -> &ParticipantId {
        &self.recipient
    }

    /// Absolute expiry date in epoch milliseconds.
    pub fn expiry_date_ms(&self) -> u64 {
        self.expiry_date_ms
    }

    /// Address the sender can be reached at, if it supplied one.
    pub fn reply_to(&self) -> Option<&Address> {
        self.reply_to.as_ref()
    }

    /// Application headers.
    pub fn custom_headers(&self) -> &HashMap<String, String> {
        &self.custom_headers
    }

    /// Serialized payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Time left before expiry, or `None` once expired.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let now = epoch_millis();
        if self.expiry_date_ms > now {
            Some(Duration::from_millis(self.expiry_date_ms - now))
        } else {
            None
        }
    }

    /// Whether the expiry date has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining_ttl().is_none()
    }
}

/// Mutable pre-wire form of a [`Message`].
///
/// # Example
///
/// ```rust,ignore
/// let message = MessageBuilder::new(MessageType::OneWay, "proxy-1", "provider-1")
///     .ttl(Ttl::Relative(Duration::from_secs(5)))
///     .header("trace", "abc")
///     .payload(bytes)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    message_type: MessageType,
    sender: ParticipantId,
    recipient: ParticipantId,
    ttl: Ttl,
    reply_to: Option<Address>,
    custom_headers: HashMap<String, String>,
    payload: Vec<u8>,
}

impl MessageBuilder {
    /// Default TTL of messages that do not set one.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    /// Start a message of the given type.
    pub fn new(
        message_type: MessageType,
        sender: impl Into<ParticipantId>,
        recipient: impl Into<ParticipantId>,
    ) -> Self {
        Self {
            id: None,
            message_type,
            sender: sender.into(),
            recipient: recipient.into(),
            ttl: Ttl::Relative(Self::DEFAULT_TTL),
            reply_to: None,
            custom_headers: HashMap::new(),
            payload: Vec::new(),
        }
    }

    /// Use a fixed message id instead of a generated one.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the TTL.
    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the reply-to address hint.
    pub fn reply_to(mut self, address: Address) -> Self {
        self.reply_to = Some(address);
        self
    }

    /// Add a custom header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    /// Merge custom headers.
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.custom_headers.extend(headers);
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Freeze the message, converting a relative TTL to an absolute date.
    pub fn build(self) -> Message {
        let expiry_date_ms = match self.ttl {
            Ttl::Absolute(date) => date,
            Ttl::Relative(ttl) => epoch_millis()
                .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
        };
        Message {
            id: self.id.unwrap_or_else(MessageId::generate),
            message_type: self.message_type,
            sender: self.sender,
            recipient: self.recipient,
            expiry_date_ms,
            reply_to: self.reply_to,
            custom_headers: self.custom_headers,
            payload: self.payload,
        }
    }
}
