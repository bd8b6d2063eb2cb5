//! Participant identifiers, addresses, envelopes and payloads.

mod address;
mod codec;
mod envelope;
mod factory;
mod ids;
mod payload;

pub use address::Address;
pub use codec::{JsonCodec, MessageCodec};
pub use envelope::{Message, MessageBuilder, MessageType, Ttl, epoch_millis};
pub use factory::{EFFORT_HEADER, MessageFactory, MessagingQos, MessagingQosEffort};
pub use ids::{MessageId, ParticipantId, RequestReplyId};
pub use payload::{OneWayRequest, Reply, Request};
