//! # Courier
//!
//! Message routing and request/reply correlation for participant-addressed
//! RPC middleware.
//!
//! Courier connects logical *participants* (proxies and providers) without
//! caring which transport carries the bytes. It provides:
//!
//! - **Routing**: a concurrent routing table and an address resolver that
//!   delegates misses to an optional parent router, coalescing concurrent
//!   lookups of the same participant.
//! - **Delivery**: a bounded delay queue drained by a worker pool that resolves
//!   recipients, obtains transport stubs and retries with backoff until the
//!   message is delivered or its TTL runs out.
//! - **Correlation**: a reply caller directory that resolves every outstanding
//!   request exactly once, with its reply or with a timeout.
//! - **Dispatch**: registration-time method tables that bind inbound requests
//!   to provider methods and turn their outcome into replies.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RequestReplyManager / Dispatcher                             │
//! │   send_request ──► MessageRouter ──► MessagingStub ──► wire  │
//! │   message_arrived ◄──────────────────────────────────── wire │
//! │      │                                                       │
//! │      ├─ Request ──► RequestInterpreter ──► provider method   │
//! │      └─ Reply   ──► ReplyCallerDirectory ──► waiting caller  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ AddressResolver ─► RoutingTable (+ ParentRouter)             │
//! │ MessagingStubFactory ─► TransportStubFactory per transport   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every component is constructed explicitly and shared through `Arc`; there
//! is no process-wide state.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Tunables consumed from the surrounding runtime.
pub mod config;

/// Error types for every layer.
pub mod error;

/// Participant identifiers, addresses, envelopes and payloads.
pub mod message;

/// Routing table and address resolution.
pub mod routing;

/// Transport stubs, the delay queue and the message router.
pub mod messaging;

/// Reply correlation.
pub mod reply;

/// Provider-side method dispatch and the request/reply manager.
pub mod dispatch;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{BackoffStrategy, MessagingConfig};

pub use error::{
    CodecError, CourierError, DeliveryError, ParentRouterError, ProviderError, ReplyError,
    RouteError, RoutingError, StubFactoryError, TransmitError,
};

pub use message::{
    Address, JsonCodec, Message, MessageBuilder, MessageCodec, MessageFactory, MessageId,
    MessageType, MessagingQos, MessagingQosEffort, OneWayRequest, ParticipantId, Reply, Request,
    RequestReplyId, Ttl,
};

pub use routing::{AddressResolver, NextHop, ParentRouter, RoutingEntry, RoutingTable};

pub use messaging::{
    DelayQueue, DeliveryTicket, FailureAction, MessageProcessedListener, MessageRouter,
    MessagingStub, MessagingStubFactory, MulticastReceiverRegistry, SuccessAction,
    TransportStubFactory,
};

pub use reply::{CallbackReplyCaller, ReplyCaller, ReplyCallerDirectory, ReplyFuture};

pub use dispatch::{
    Dispatcher, MethodTable, MethodTableBuilder, Provider, ProviderCallback, ReplyCallback,
    RequestCaller, RequestCallerDirectory, RequestCallerListener, RequestInterpreter,
    RequestReplyManager,
};
