use crate::error::CodecError;
use crate::message::{
    Address, JsonCodec, Message, MessageBuilder, MessageCodec, MessageType, OneWayRequest,
    ParticipantId, Reply, Request, Ttl,
};
use std::collections::HashMap;
use std::time::Duration;

/// Envelope header carrying the delivery effort.
pub const EFFORT_HEADER: &str = "effort";

/// How hard transports should try to deliver a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessagingQosEffort {
    /// Regular delivery.
    #[default]
    Normal,
    /// Transports may drop the message instead of persisting it.
    BestEffort,
}

impl MessagingQosEffort {
    /// Header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagingQosEffort::Normal => "NORMAL",
            MessagingQosEffort::BestEffort => "BEST_EFFORT",
        }
    }
}

/// Per-call quality of service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingQos {
    /// How long the caller waits for the reply, and the TTL of the request.
    pub round_trip_ttl: Duration,
    /// Headers copied onto the envelope.
    pub custom_headers: HashMap<String, String>,
    /// Delivery effort, stamped as the `effort` header when not normal.
    pub effort: MessagingQosEffort,
}

impl Default for MessagingQos {
    fn default() -> Self {
        Self {
            round_trip_ttl: Duration::from_secs(60),
            custom_headers: HashMap::new(),
            effort: MessagingQosEffort::Normal,
        }
    }
}

impl MessagingQos {
    /// QoS with the given round-trip TTL.
    pub fn with_ttl(round_trip_ttl: Duration) -> Self {
        Self {
            round_trip_ttl,
            ..Self::default()
        }
    }

    /// Add a custom header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    /// Set the delivery effort.
    pub fn with_effort(mut self, effort: MessagingQosEffort) -> Self {
        self.effort = effort;
        self
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = self.custom_headers.clone();
        if self.effort != MessagingQosEffort::Normal {
            headers.insert(EFFORT_HEADER.to_string(), self.effort.as_str().to_string());
        }
        headers
    }
}

/// Builds envelopes around request, reply and one-way payloads.
#[derive(Debug, Clone, Default)]
pub struct MessageFactory {
    codec: JsonCodec,
    reply_to: Option<Address>,
}

impl MessageFactory {
    /// Create a factory using the JSON codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp every request with this reply-to address.
    pub fn with_reply_to(mut self, address: Address) -> Self {
        self.reply_to = Some(address);
        self
    }

    /// Codec used for payloads.
    pub fn codec(&self) -> &JsonCodec {
        &self.codec
    }

    /// Build a request envelope whose TTL is the round-trip TTL.
    pub fn create_request(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        request: &Request,
        qos: &MessagingQos,
    ) -> Result<Message, CodecError> {
        let mut builder = MessageBuilder::new(MessageType::Request, from.clone(), to.clone())
            .ttl(Ttl::Relative(qos.round_trip_ttl))
            .headers(qos.headers())
            .payload(self.codec.encode(request)?);
        if let Some(address) = &self.reply_to {
            builder = builder.reply_to(address.clone());
        }
        Ok(builder.build())
    }

    /// Build a one-way envelope.
    pub fn create_one_way_request(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        request: &OneWayRequest,
        qos: &MessagingQos,
    ) -> Result<Message, CodecError> {
        Ok(
            MessageBuilder::new(MessageType::OneWay, from.clone(), to.clone())
                .ttl(Ttl::Relative(qos.round_trip_ttl))
                .headers(qos.headers())
                .payload(self.codec.encode(request)?)
                .build(),
        )
    }

    /// Build a reply envelope that expires with the request it answers.
    pub fn create_reply(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        reply: &Reply,
        expiry_date_ms: u64,
    ) -> Result<Message, CodecError> {
        Ok(
            MessageBuilder::new(MessageType::Reply, from.clone(), to.clone())
                .ttl(Ttl::Absolute(expiry_date_ms))
                .payload(self.codec.encode(reply)?)
                .build(),
        )
    }

    /// Decode the request carried by `message`.
    pub fn decode_request(&self, message: &Message) -> Result<Request, CodecError> {
        self.expect_type(message, MessageType::Request)?;
        self.codec.decode(message.payload())
    }

    /// Decode the one-way request carried by `message`.
    pub fn decode_one_way_request(&self, message: &Message) -> Result<OneWayRequest, CodecError> {
        self.expect_type(message, MessageType::OneWay)?;
        self.codec.decode(message.payload())
    }

    /// Decode the reply carried by `message`.
    pub fn decode_reply(&self, message: &Message) -> Result<Reply, CodecError> {
        self.expect_type(message, MessageType::Reply)?;
        self.codec.decode(message.payload())
    }

    fn expect_type(&self, message: &Message, expected: MessageType) -> Result<(), CodecError> {
        if message.message_type() == expected {
            Ok(())
        } else {
            Err(CodecError::UnexpectedType {
                expected: expected.as_str(),
                actual: message.message_type().as_str(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_round_trip() {
        let factory = MessageFactory::new().with_reply_to(Address::mqtt("tcp://b", "proxy"));
        let request = Request::new("echoString", vec![json!("hi")], vec!["String".into()]);
        let qos = MessagingQos::with_ttl(Duration::from_secs(5)).header("k", "v");

        let msg = factory
            .create_request(&"proxy".into(), &"provider".into(), &request, &qos)
            .unwrap();

        assert_eq!(msg.message_type(), MessageType::Request);
        assert_eq!(msg.custom_headers().get("k").map(String::as_str), Some("v"));
        assert!(msg.reply_to().is_some());
        assert_eq!(factory.decode_request(&msg).unwrap(), request);
    }

    #[test]
    fn test_best_effort_is_stamped_as_header() {
        let factory = MessageFactory::new();
        let request = OneWayRequest::new("notify", vec![], vec![]);
        let qos = MessagingQos::default().with_effort(MessagingQosEffort::BestEffort);

        let msg = factory
            .create_one_way_request(&"a".into(), &"b".into(), &request, &qos)
            .unwrap();
        assert_eq!(
            msg.custom_headers().get(EFFORT_HEADER).map(String::as_str),
            Some("BEST_EFFORT")
        );
    }

    #[test]
    fn test_decode_wrong_type_fails() {
        let factory = MessageFactory::new();
        let reply = Reply::success("r".into(), vec![]);
        let msg = factory
            .create_reply(&"a".into(), &"b".into(), &reply, u64::MAX)
            .unwrap();
        assert!(matches!(
            factory.decode_request(&msg),
            Err(CodecError::UnexpectedType { .. })
        ));
    }
}
