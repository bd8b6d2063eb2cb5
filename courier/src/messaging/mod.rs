//! Outbound delivery: transport stubs, the delay queue and the router.

mod backoff;
mod delay_queue;
mod multicast;
mod router;
mod stub;
mod stub_factory;

pub use backoff::Backoff;
pub use delay_queue::{DelayQueue, QueueError};
pub use multicast::MulticastReceiverRegistry;
pub use router::{DeliveryTicket, MessageProcessedListener, MessageRouter};
pub use stub::{FailureAction, MessagingStub, SuccessAction};
pub use stub_factory::{MessagingStubFactory, TransportStubFactory};
