//! Error types for courier.
//!
//! Each layer has its own enum. [`ReplyError`] is the only one that crosses
//! the wire: it travels inside a [`Reply`](crate::message::Reply) so that a
//! caller always receives a structured failure instead of a transport-level
//! exception.

use crate::message::{MessageId, ParticipantId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised synchronously when a message is handed to the router.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    /// The message was already expired when it was submitted.
    #[error("message {message_id} expired before it was accepted")]
    Expired {
        /// Identifier of the rejected message.
        message_id: MessageId,
    },

    /// The delivery queue is at capacity.
    #[error("routing queue full (capacity: {capacity})")]
    BufferFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The router no longer accepts messages.
    #[error("router is shutting down")]
    Shutdown,
}

/// Terminal failure of a message that had been accepted by the router.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The message TTL ran out before a transmission succeeded.
    #[error("message {message_id} expired after {attempts} delivery attempts")]
    Expired {
        /// Identifier of the expired message.
        message_id: MessageId,
        /// Number of transmissions attempted.
        attempts: u32,
    },

    /// The message can never be delivered (no route, rejected by transport).
    #[error("message {message_id} not sent: {reason}")]
    NotSent {
        /// Identifier of the discarded message.
        message_id: MessageId,
        /// Human-readable cause.
        reason: String,
    },

    /// The configured retry limit was reached.
    #[error("message {message_id} gave up after {max} retries")]
    RetryLimitReached {
        /// Identifier of the abandoned message.
        message_id: MessageId,
        /// Configured maximum number of retries.
        max: u32,
    },

    /// The router shut down while the message was still queued.
    #[error("router shut down before message {message_id} was delivered")]
    Shutdown {
        /// Identifier of the cancelled message.
        message_id: MessageId,
    },
}

impl DeliveryError {
    /// Whether this failure belongs to the timeout class.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeliveryError::Expired { .. })
    }

    /// Identifier of the message that failed.
    pub fn message_id(&self) -> &MessageId {
        match self {
            DeliveryError::Expired { message_id, .. }
            | DeliveryError::NotSent { message_id, .. }
            | DeliveryError::RetryLimitReached { message_id, .. }
            | DeliveryError::Shutdown { message_id } => message_id,
        }
    }
}

/// Failure reported by a [`MessagingStub`](crate::messaging::MessagingStub).
///
/// Only transport failures are reported here. A remote that received the
/// message but failed to process it answers with a reply instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransmitError {
    /// Transient failure; the router retries with backoff.
    #[error("transmission failed: {0}")]
    Retryable(String),

    /// The transport asks for the next attempt to wait this long.
    #[error("transport requested a delay of {0:?}")]
    Delay(Duration),

    /// The message must not be retried.
    #[error("message rejected by transport: {0}")]
    NotSent(String),

    /// The stub was closed; a fresh one is created on the next attempt.
    #[error("messaging stub closed")]
    Closed,
}

/// Errors raised by a parent router.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParentRouterError {
    /// The parent could not be reached.
    #[error("parent router unavailable: {0}")]
    Unavailable(String),

    /// The parent did not answer in time.
    #[error("parent router call timed out")]
    Timeout,
}

/// Errors raised while resolving a participant to an address.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// Neither the local table nor the parent knows the participant.
    #[error("no route to participant {0}")]
    NoRoute(ParticipantId),

    /// The parent router call failed.
    #[error("parent resolution failed: {0}")]
    Parent(#[from] ParentRouterError),
}

/// Errors raised by the messaging stub factory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StubFactoryError {
    /// No transport factory accepts this address kind.
    #[error("no transport for address kind {kind}")]
    Unsupported {
        /// Address kind that was requested.
        kind: &'static str,
    },

    /// A transport factory failed to build the stub.
    #[error("stub creation failed: {0}")]
    CreationFailed(String),

    /// The factory has been shut down.
    #[error("stub factory is shut down")]
    Shutdown,
}

/// Errors raised while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The envelope type does not carry the expected payload.
    #[error("expected {expected} payload, got {actual}")]
    UnexpectedType {
        /// Payload kind the caller asked for.
        expected: &'static str,
        /// Message type found on the envelope.
        actual: &'static str,
    },
}

/// Structured failure carried by a reply.
///
/// This is what a caller observes when a request does not succeed: a
/// timeout, a dispatch failure on the provider, an application error raised
/// by the provider, or a delivery failure on the way.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyError {
    /// No reply arrived within the round-trip TTL.
    #[error("request timed out")]
    Timeout,

    /// The request could not be bound to a provider method, or the method
    /// failed outside its own error path.
    #[error("method invocation failed: {message}")]
    MethodInvocation {
        /// Description of the binding or invocation failure.
        message: String,
    },

    /// The provider rejected the call with an application error.
    #[error("{error_name}: {message}")]
    Application {
        /// Application error name, as declared by the provider interface.
        error_name: String,
        /// Application error detail.
        message: String,
    },

    /// The provider failed with a runtime error.
    #[error("provider runtime error: {message}")]
    ProviderRuntime {
        /// Description of the runtime failure.
        message: String,
    },

    /// The request could not be delivered to the provider.
    #[error("request not delivered: {message}")]
    Delivery {
        /// Description of the delivery failure.
        message: String,
    },

    /// The local or remote side is shutting down.
    #[error("shutting down")]
    Shutdown,

    /// A payload could not be encoded or decoded.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Codec error text.
        message: String,
    },
}

impl ReplyError {
    /// Build a [`ReplyError::MethodInvocation`].
    pub fn method_invocation(message: impl Into<String>) -> Self {
        ReplyError::MethodInvocation {
            message: message.into(),
        }
    }

    /// Whether this failure belongs to the timeout class.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReplyError::Timeout)
    }
}

impl From<DeliveryError> for ReplyError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Expired { .. } => ReplyError::Timeout,
            DeliveryError::Shutdown { .. } => ReplyError::Shutdown,
            other => ReplyError::Delivery {
                message: other.to_string(),
            },
        }
    }
}

impl From<RouteError> for ReplyError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::Expired { .. } => ReplyError::Timeout,
            RouteError::Shutdown => ReplyError::Shutdown,
            other @ RouteError::BufferFull { .. } => ReplyError::Delivery {
                message: other.to_string(),
            },
        }
    }
}

impl From<CodecError> for ReplyError {
    fn from(err: CodecError) -> Self {
        ReplyError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Error returned by a provider method body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A declared application error, propagated verbatim to the caller.
    #[error("{name}: {message}")]
    Application {
        /// Application error name.
        name: String,
        /// Application error detail.
        message: String,
    },

    /// Any other provider failure.
    #[error("{0}")]
    Runtime(String),
}

impl ProviderError {
    /// Build an application error.
    pub fn application(name: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Application {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build a runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        ProviderError::Runtime(message.into())
    }
}

impl From<ProviderError> for ReplyError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Application { name, message } => ReplyError::Application {
                error_name: name,
                message,
            },
            ProviderError::Runtime(message) => ReplyError::ProviderRuntime { message },
        }
    }
}

/// Umbrella error for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum CourierError {
    /// Router rejected the message.
    #[error("route error: {0}")]
    Route(#[from] RouteError),

    /// Accepted message was not delivered.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Address resolution failed.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Stub factory failed.
    #[error("stub factory error: {0}")]
    StubFactory(#[from] StubFactoryError),

    /// Request failed.
    #[error("reply error: {0}")]
    Reply(#[from] ReplyError),

    /// Payload codec failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_errors_map_to_reply_errors() {
        let id = MessageId::new("m1");
        let expired = DeliveryError::Expired {
            message_id: id.clone(),
            attempts: 3,
        };
        assert!(expired.is_timeout());
        assert_eq!(ReplyError::from(expired), ReplyError::Timeout);

        let not_sent = DeliveryError::NotSent {
            message_id: id.clone(),
            reason: "no route".to_string(),
        };
        assert!(matches!(
            ReplyError::from(not_sent),
            ReplyError::Delivery { .. }
        ));

        let shutdown = DeliveryError::Shutdown { message_id: id };
        assert_eq!(ReplyError::from(shutdown), ReplyError::Shutdown);
    }

    #[test]
    fn provider_application_error_is_verbatim() {
        let err = ProviderError::application("InsufficientFunds", "have 5, need 10");
        assert_eq!(
            ReplyError::from(err),
            ReplyError::Application {
                error_name: "InsufficientFunds".to_string(),
                message: "have 5, need 10".to_string(),
            }
        );
    }

    #[test]
    fn reply_error_serializes_with_kind_tag() {
        let err = ReplyError::method_invocation("unknown method frobnicate");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "method_invocation");
        let back: ReplyError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
