use crate::message::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport address of a participant.
///
/// Carries what a transport stub factory needs to open or reuse a
/// connection. Addresses compare by value, so two lookups yielding equal
/// addresses share a cached stub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Address {
    /// Broker topic (MQTT style).
    Mqtt {
        /// Broker URI, e.g. `tcp://broker:1883`.
        broker_uri: String,
        /// Topic the recipient listens on.
        topic: String,
    },

    /// WebSocket server endpoint.
    WebSocket {
        /// `ws` or `wss`.
        protocol: String,
        /// Server host.
        host: String,
        /// Server port.
        port: u16,
        /// Request path.
        path: String,
    },

    /// Client connected to a local WebSocket server.
    WebSocketClient {
        /// Client identifier assigned on connect.
        id: String,
    },

    /// HTTP long-poll channel.
    Channel {
        /// Messaging endpoint URL.
        messaging_endpoint_url: String,
        /// Channel identifier.
        channel_id: String,
    },

    /// Participant hosted by the same process.
    InProcess {
        /// Local participant.
        participant_id: ParticipantId,
    },
}

impl Address {
    /// Short name of the transport kind, used for stub factory selection
    /// and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Address::Mqtt { .. } => "mqtt",
            Address::WebSocket { .. } => "websocket",
            Address::WebSocketClient { .. } => "websocket_client",
            Address::Channel { .. } => "channel",
            Address::InProcess { .. } => "in_process",
        }
    }

    /// Convenience constructor for a broker-topic address.
    pub fn mqtt(broker_uri: impl Into<String>, topic: impl Into<String>) -> Self {
        Address::Mqtt {
            broker_uri: broker_uri.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Mqtt { broker_uri, topic } => write!(f, "mqtt:{broker_uri}/{topic}"),
            Address::WebSocket {
                protocol,
                host,
                port,
                path,
            } => write!(f, "{protocol}://{host}:{port}{path}"),
            Address::WebSocketClient { id } => write!(f, "ws-client:{id}"),
            Address::Channel {
                messaging_endpoint_url,
                channel_id,
            } => write!(f, "channel:{messaging_endpoint_url}#{channel_id}"),
            Address::InProcess { participant_id } => write!(f, "in-process:{participant_id}"),
        }
    }
}
