//! Retry-with-backoff delivery engine.
//!
//! # Message lifecycle
//!
//! ```text
//!            route()
//!               │  rejects: Expired / BufferFull / Shutdown
//!               ▼
//!  ┌──────► Pending ──(worker pops when ready)──► InFlight
//!  │                                               │
//!  │        transmit ok ──────────────────────────►├──► Delivered
//!  │        transmit failed, TTL left ─────────────┤
//!  └──────── RetryScheduled (now + backoff) ◄──────┘
//!                                                  └──► Expired / NotSent
//! ```
//!
//! Every accepted message is finalized exactly once. The outcome resolves
//! its [`DeliveryTicket`] and is announced to the registered
//! [`MessageProcessedListener`]s.
//!
//! A multicast is queued once per subscriber in the
//! [`MulticastReceiverRegistry`]. Each copy is retried on its own; the
//! message is finalized when the last copy is.

use crate::config::MessagingConfig;
use crate::error::{DeliveryError, ReplyError, RouteError, RoutingError, StubFactoryError, TransmitError};
use crate::message::{Address, Message, MessageFactory, MessageId, MessageType, ParticipantId, Reply};
use crate::messaging::{Backoff, DelayQueue, MessagingStubFactory, MulticastReceiverRegistry, QueueError};
use crate::routing::{AddressResolver, RoutingTable};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Observer notified once per message when its processing is over.
pub trait MessageProcessedListener: Send + Sync {
    /// `message_id` reached a terminal state (delivered, expired, discarded).
    fn message_processed(&self, message_id: &MessageId);
}

/// Resolves once with the delivery outcome of a routed message.
///
/// Dropping the ticket does not cancel delivery.
#[derive(Debug)]
pub struct DeliveryTicket {
    message_id: MessageId,
    receiver: oneshot::Receiver<Result<(), DeliveryError>>,
}

impl DeliveryTicket {
    /// Identifier of the routed message.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

impl Future for DeliveryTicket {
    type Output = Result<(), DeliveryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DeliveryError::Shutdown {
                message_id: self.message_id.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A message waiting in, or travelling through, the delivery pipeline.
struct QueuedMessage {
    message: Arc<Message>,
    /// The envelope recipient, or one subscriber of a multicast.
    recipient: ParticipantId,
    deadline: Instant,
    retries: u32,
    attempts: u32,
    ticket: Option<TicketSlot>,
}

enum TicketSlot {
    Single(oneshot::Sender<Result<(), DeliveryError>>),
    Shared(Arc<FanOut>),
}

/// Joins the outcomes of the copies of one multicast.
///
/// The ticket resolves after the last copy: `Ok` if every copy was
/// delivered, the first failure otherwise.
struct FanOut {
    state: Mutex<FanOutState>,
}

struct FanOutState {
    remaining: usize,
    failure: Option<DeliveryError>,
    ticket: Option<oneshot::Sender<Result<(), DeliveryError>>>,
}

impl FanOut {
    fn new(copies: usize, ticket: oneshot::Sender<Result<(), DeliveryError>>) -> Self {
        Self {
            state: Mutex::new(FanOutState {
                remaining: copies,
                failure: None,
                ticket: Some(ticket),
            }),
        }
    }

    /// Record the outcome of one copy. Returns whether it was the last one.
    fn complete(&self, outcome: Result<(), DeliveryError>) -> bool {
        let mut state = self.state.lock();
        if let Err(err) = outcome {
            state.failure.get_or_insert(err);
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining > 0 {
            return false;
        }
        if let Some(ticket) = state.ticket.take() {
            let _ = ticket.send(state.failure.take().map_or(Ok(()), Err));
        }
        true
    }
}

struct RouterInner {
    config: MessagingConfig,
    backoff: Backoff,
    resolver: Arc<AddressResolver>,
    stubs: Arc<MessagingStubFactory>,
    queue: DelayQueue<QueuedMessage>,
    multicast_receivers: MulticastReceiverRegistry,
    factory: MessageFactory,
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn MessageProcessedListener>>>,
}

/// Delivers messages to participants, retrying until success or expiry.
///
/// # Example
///
/// ```rust,ignore
/// let config = MessagingConfig::default();
/// let table = Arc::new(RoutingTable::new());
/// let resolver = Arc::new(
///     AddressResolver::child(table).with_parent_resolution_timeout(config.parent_resolution_timeout),
/// );
/// let stubs = Arc::new(MessagingStubFactory::new().with_transport(mqtt));
/// let router = MessageRouter::new(config, resolver, stubs);
///
/// let ticket = router.route(message)?;
/// ticket.await?; // delivered
/// ```
pub struct MessageRouter {
    inner: Arc<RouterInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouter {
    /// Start a router with `config.worker_count` delivery workers.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: MessagingConfig,
        resolver: Arc<AddressResolver>,
        stubs: Arc<MessagingStubFactory>,
    ) -> Self {
        let inner = Arc::new(RouterInner {
            backoff: Backoff::from_config(&config),
            queue: DelayQueue::new(config.queue_capacity),
            multicast_receivers: MulticastReceiverRegistry::new(),
            resolver,
            stubs,
            factory: MessageFactory::new(),
            in_flight: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            config,
        });

        let mut tasks = Vec::with_capacity(inner.config.worker_count + 1);
        for worker_id in 0..inner.config.worker_count.max(1) {
            let inner = inner.clone();
            tasks.push(tokio::spawn(async move {
                tracing::trace!(worker_id, "Delivery worker started");
                while let Some(queued) = inner.queue.pop().await {
                    RouterInner::process(&inner, queued).await;
                }
                tracing::trace!(worker_id, "Delivery worker stopped");
            }));
        }
        if !inner.config.routing_table_cleanup_interval.is_zero() {
            tasks.push(RoutingTable::spawn_cleanup(
                inner.resolver.table(),
                inner.config.routing_table_cleanup_interval,
            ));
        }

        Self {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    /// Accept `message` for delivery.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the message is already expired, the queue is
    /// full, or the router is shutting down. Once accepted, the outcome is
    /// reported through the returned ticket.
    pub fn route(&self, message: Message) -> Result<DeliveryTicket, RouteError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(RouteError::Shutdown);
        }
        let Some(remaining) = message.remaining_ttl() else {
            tracing::debug!(message_id = %message.id(), "Rejecting expired message");
            return Err(RouteError::Expired {
                message_id: message.id().clone(),
            });
        };

        let now = Instant::now();
        let deadline = now + remaining;
        let message_id = message.id().clone();
        let (sender, receiver) = oneshot::channel();
        let ticket = DeliveryTicket {
            message_id: message_id.clone(),
            receiver,
        };

        let recipients = if message.message_type() == MessageType::Multicast {
            self.inner
                .multicast_receivers
                .receivers(message.recipient().as_str())
        } else {
            vec![message.recipient().clone()]
        };
        let message = Arc::new(message);

        if recipients.is_empty() {
            tracing::debug!(
                %message_id,
                multicast_id = %message.recipient(),
                "Multicast has no receivers"
            );
            let queued = QueuedMessage {
                recipient: message.recipient().clone(),
                message,
                deadline,
                retries: 0,
                attempts: 0,
                ticket: Some(TicketSlot::Single(sender)),
            };
            self.inner.finalize(queued, Err(DeliveryError::NotSent {
                message_id,
                reason: "no multicast receivers".to_string(),
            }));
            return Ok(ticket);
        }

        let slots: Vec<TicketSlot> = if recipients.len() == 1 {
            vec![TicketSlot::Single(sender)]
        } else {
            tracing::trace!(%message_id, copies = recipients.len(), "Fanning out multicast");
            let fan_out = Arc::new(FanOut::new(recipients.len(), sender));
            recipients
                .iter()
                .map(|_| TicketSlot::Shared(fan_out.clone()))
                .collect()
        };
        let mut copies = recipients
            .into_iter()
            .zip(slots)
            .map(|(recipient, slot)| QueuedMessage {
                message: message.clone(),
                recipient,
                deadline,
                retries: 0,
                attempts: 0,
                ticket: Some(slot),
            });

        // The bound applies to the routed message; further copies ride along.
        if let Some(first) = copies.next() {
            match self.inner.queue.push(first, now) {
                Ok(()) => {}
                Err(QueueError::Full { capacity }) => {
                    tracing::warn!(%message_id, capacity, "Delivery queue full, rejecting message");
                    return Err(RouteError::BufferFull { capacity });
                }
                Err(QueueError::Closed) => return Err(RouteError::Shutdown),
            }
        }
        for copy in copies {
            if let Err(copy) = self.inner.queue.requeue(copy, now) {
                let message_id = copy.message.id().clone();
                self.inner
                    .finalize(copy, Err(DeliveryError::Shutdown { message_id }));
            }
        }

        tracing::trace!(%message_id, "Message accepted for delivery");
        Ok(ticket)
    }

    /// Subscribe `subscriber_id` to multicasts published under `multicast_id`.
    ///
    /// Returns `false` if the subscription already existed.
    pub fn add_multicast_receiver(&self, multicast_id: &str, subscriber_id: ParticipantId) -> bool {
        tracing::trace!(multicast_id, %subscriber_id, "Adding multicast receiver");
        self.inner
            .multicast_receivers
            .register(multicast_id, subscriber_id)
    }

    /// Drop a multicast subscription.
    pub fn remove_multicast_receiver(&self, multicast_id: &str, subscriber_id: &ParticipantId) -> bool {
        tracing::trace!(multicast_id, %subscriber_id, "Removing multicast receiver");
        self.inner
            .multicast_receivers
            .unregister(multicast_id, subscriber_id)
    }

    /// Subscriptions consulted when routing multicasts.
    pub fn multicast_receivers(&self) -> &MulticastReceiverRegistry {
        &self.inner.multicast_receivers
    }

    /// Register an observer of finalized messages.
    pub fn add_message_processed_listener(&self, listener: Arc<dyn MessageProcessedListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// The resolver used by this router.
    pub fn resolver(&self) -> &Arc<AddressResolver> {
        &self.inner.resolver
    }

    /// Register a locally reachable participant.
    pub async fn add_next_hop(
        &self,
        participant_id: ParticipantId,
        address: Address,
        is_globally_visible: bool,
    ) -> Result<(), RoutingError> {
        self.inner
            .resolver
            .add_next_hop(participant_id, address, is_globally_visible)
            .await
    }

    /// Forget a participant.
    pub async fn remove_next_hop(&self, participant_id: &ParticipantId) -> Result<(), RoutingError> {
        self.inner.resolver.remove_next_hop(participant_id).await
    }

    /// Whether `participant_id` can currently be routed to.
    pub async fn resolve_next_hop(&self, participant_id: &ParticipantId) -> bool {
        self.inner.resolver.resolve(participant_id).await.is_ok()
    }

    /// Number of messages waiting in the queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of transmissions awaiting a transport verdict.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until the queue and in-flight transmissions drain, bounded by
    /// `shutdown_drain_timeout`. Returns whether everything drained.
    pub async fn prepare_for_shutdown(&self) -> bool {
        let deadline = Instant::now() + self.inner.config.shutdown_drain_timeout;
        loop {
            if self.queued() == 0 && self.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    queued = self.queued(),
                    in_flight = self.in_flight(),
                    "Delivery queue did not drain before shutdown"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting messages, fail the queued ones, stop the workers and
    /// close every stub.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Message router shutting down");

        self.inner.queue.close();
        for queued in self.inner.queue.drain() {
            let message_id = queued.message.id().clone();
            self.inner
                .finalize(queued, Err(DeliveryError::Shutdown { message_id }));
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let drain_timeout = self.inner.config.shutdown_drain_timeout;
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(drain_timeout, task).await.is_err() {
                abort.abort();
            }
        }

        self.inner.stubs.shutdown();
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.inner.queue.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl RouterInner {
    async fn process(inner: &Arc<Self>, queued: QueuedMessage) {
        let message_id = queued.message.id().clone();
        if Instant::now() >= queued.deadline {
            let attempts = queued.attempts;
            inner.finalize(queued, Err(DeliveryError::Expired {
                message_id,
                attempts,
            }));
            return;
        }

        let recipient = queued.recipient.clone();
        let address = match tokio::time::timeout_at(
            queued.deadline,
            inner.resolver.resolve(&recipient),
        )
        .await
        {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => {
                if queued.message.message_type().discard_if_unroutable() {
                    tracing::warn!(
                        %message_id,
                        %recipient,
                        message_type = queued.message.message_type().as_str(),
                        "No route to recipient, discarding message"
                    );
                    inner.finalize(queued, Err(DeliveryError::NotSent {
                        message_id,
                        reason: err.to_string(),
                    }));
                } else {
                    tracing::debug!(%message_id, %recipient, error = %err, "Recipient not resolvable yet");
                    inner.schedule_retry(queued, TransmitError::Retryable(err.to_string()));
                }
                return;
            }
            Err(_elapsed) => {
                let attempts = queued.attempts;
                inner.finalize(queued, Err(DeliveryError::Expired {
                    message_id,
                    attempts,
                }));
                return;
            }
        };

        let stub = match inner.stubs.create(&address) {
            Ok(stub) => stub,
            Err(StubFactoryError::CreationFailed(reason)) => {
                tracing::debug!(%message_id, %address, %reason, "Stub creation failed");
                inner.schedule_retry(queued, TransmitError::Retryable(reason));
                return;
            }
            Err(err @ StubFactoryError::Unsupported { .. }) => {
                tracing::error!(%message_id, %address, error = %err, "Cannot send message");
                inner.finalize(queued, Err(DeliveryError::NotSent {
                    message_id,
                    reason: err.to_string(),
                }));
                return;
            }
            Err(StubFactoryError::Shutdown) => {
                inner.finalize(queued, Err(DeliveryError::Shutdown { message_id }));
                return;
            }
        };

        tracing::trace!(
            %message_id,
            %recipient,
            %address,
            attempt = queued.attempts + 1,
            "Transmitting message"
        );

        let mut queued = queued;
        queued.attempts += 1;
        let message = queued.message.clone();
        let slot = Arc::new(Mutex::new(Some((queued, address))));
        inner.in_flight.fetch_add(1, Ordering::AcqRel);

        let on_success = {
            let inner = inner.clone();
            let slot = slot.clone();
            Box::new(move || {
                if let Some((queued, _)) = slot.lock().take() {
                    inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                    tracing::trace!(message_id = %queued.message.id(), "Message delivered");
                    inner.finalize(queued, Ok(()));
                }
            })
        };
        let on_failure = {
            let inner = inner.clone();
            Box::new(move |error: TransmitError| {
                if let Some((queued, address)) = slot.lock().take() {
                    inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                    inner.handle_failure(queued, address, error);
                }
            })
        };

        stub.transmit(message, on_success, on_failure);
    }

    fn handle_failure(self: &Arc<Self>, queued: QueuedMessage, address: Address, error: TransmitError) {
        let message_id = queued.message.id().clone();
        if self.shutting_down.load(Ordering::Acquire) {
            tracing::debug!(%message_id, error = %error, "Transmit failed during shutdown");
            self.finalize(queued, Err(DeliveryError::Shutdown { message_id }));
            return;
        }

        match error {
            TransmitError::NotSent(reason) => {
                tracing::error!(%message_id, %reason, "Message rejected by transport");
                self.finalize(queued, Err(DeliveryError::NotSent { message_id, reason }));
            }
            TransmitError::Closed => {
                self.stubs.remove(&address);
                self.schedule_retry(queued, TransmitError::Closed);
            }
            other => self.schedule_retry(queued, other),
        }
    }

    fn schedule_retry(self: &Arc<Self>, mut queued: QueuedMessage, error: TransmitError) {
        let message_id = queued.message.id().clone();
        if let Some(max) = self.config.max_retry_count {
            if queued.retries >= max {
                tracing::warn!(%message_id, max, error = %error, "Retry limit reached");
                self.finalize(queued, Err(DeliveryError::RetryLimitReached { message_id, max }));
                return;
            }
        }

        let delay = match error {
            TransmitError::Delay(delay) => delay,
            _ => self.backoff.delay(queued.retries),
        };
        queued.retries += 1;

        // Never wait past the TTL; the worker reports expiry at the deadline.
        let ready_at = (Instant::now() + delay).min(queued.deadline);
        tracing::debug!(
            %message_id,
            retries = queued.retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Scheduling delivery retry"
        );

        if let Err(queued) = self.queue.requeue(queued, ready_at) {
            let message_id = queued.message.id().clone();
            self.finalize(queued, Err(DeliveryError::Shutdown { message_id }));
        }
    }

    fn finalize(self: &Arc<Self>, mut queued: QueuedMessage, outcome: Result<(), DeliveryError>) {
        if let Err(err) = &outcome {
            match err {
                DeliveryError::Expired { .. } => {
                    tracing::warn!(message_id = %queued.message.id(), error = %err, "Message expired");
                }
                DeliveryError::NotSent { .. } => self.reply_with_error(&queued.message, err),
                _ => {}
            }
        }

        let last_copy = match queued.ticket.take() {
            Some(TicketSlot::Single(ticket)) => {
                let _ = ticket.send(outcome);
                true
            }
            Some(TicketSlot::Shared(fan_out)) => fan_out.complete(outcome),
            None => true,
        };
        if !last_copy {
            return;
        }
        for listener in self.listeners.read().iter() {
            listener.message_processed(queued.message.id());
        }
    }

    /// Answer an undeliverable request so its caller does not wait for the TTL.
    fn reply_with_error(self: &Arc<Self>, message: &Message, err: &DeliveryError) {
        if message.message_type() != MessageType::Request || message.is_expired() {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let request = match self.factory.decode_request(message) {
            Ok(request) => request,
            Err(decode_err) => {
                tracing::debug!(message_id = %message.id(), error = %decode_err, "Cannot answer undecodable request");
                return;
            }
        };
        let reply = Reply::failure(request.request_reply_id, ReplyError::from(err.clone()));
        let reply_message = match self.factory.create_reply(
            message.recipient(),
            message.sender(),
            &reply,
            message.expiry_date_ms(),
        ) {
            Ok(reply_message) => reply_message,
            Err(encode_err) => {
                tracing::error!(message_id = %message.id(), error = %encode_err, "Cannot encode error reply");
                return;
            }
        };

        let now = Instant::now();
        let Some(remaining) = reply_message.remaining_ttl() else {
            return;
        };
        let queued = QueuedMessage {
            deadline: now + remaining,
            recipient: reply_message.recipient().clone(),
            message: Arc::new(reply_message),
            retries: 0,
            attempts: 0,
            ticket: None,
        };
        if let Err(queued) = self.queue.requeue(queued, now) {
            tracing::debug!(message_id = %queued.message.id(), "Dropping error reply, router closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBuilder, Ttl};
    use crate::messaging::{FailureAction, MessagingStub, SuccessAction, TransportStubFactory};
    use std::sync::atomic::AtomicU32;

    struct FlakyStub {
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    impl MessagingStub for FlakyStub {
        fn transmit(&self, _message: Arc<Message>, on_success: SuccessAction, on_failure: FailureAction) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                on_failure(TransmitError::Retryable("connection refused".into()));
            } else {
                on_success();
            }
        }
    }

    struct Single(Arc<FlakyStub>);

    impl TransportStubFactory for Single {
        fn can_create(&self, _address: &Address) -> bool {
            true
        }

        fn create(&self, _address: &Address) -> Result<Arc<dyn MessagingStub>, StubFactoryError> {
            Ok(self.0.clone())
        }
    }

    fn router_with(failures: u32, config: MessagingConfig) -> (MessageRouter, Arc<FlakyStub>) {
        let stub = Arc::new(FlakyStub {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        });
        let table = Arc::new(RoutingTable::new());
        table.put("provider".into(), Address::mqtt("tcp://b", "provider"), false);
        let resolver = Arc::new(AddressResolver::new(table));
        let stubs = Arc::new(MessagingStubFactory::new().with_transport(Arc::new(Single(stub.clone()))));
        (MessageRouter::new(config, resolver, stubs), stub)
    }

    fn one_way(ttl: Duration) -> Message {
        MessageBuilder::new(MessageType::OneWay, "proxy", "provider")
            .ttl(Ttl::Relative(ttl))
            .build()
    }

    fn fast_config() -> MessagingConfig {
        MessagingConfig::local().with_retry_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_delivers_on_first_attempt() {
        let (router, stub) = router_with(0, fast_config());
        router.route(one_way(Duration::from_secs(1))).unwrap().await.unwrap();
        assert_eq!(stub.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_expired_message() {
        let (router, _stub) = router_with(0, fast_config());
        let expired = MessageBuilder::new(MessageType::OneWay, "proxy", "provider")
            .ttl(Ttl::Absolute(1))
            .build();
        assert!(matches!(router.route(expired), Err(RouteError::Expired { .. })));
    }

    #[tokio::test]
    async fn test_retry_limit() {
        let (router, stub) = router_with(100, fast_config().with_max_retry_count(Some(2)));
        let result = router.route(one_way(Duration::from_secs(5))).unwrap().await;
        assert!(matches!(result, Err(DeliveryError::RetryLimitReached { max: 2, .. })));
        assert_eq!(stub.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unroutable_reply_is_discarded() {
        let (router, _stub) = router_with(0, fast_config());
        let reply = MessageBuilder::new(MessageType::Reply, "provider", "nobody")
            .ttl(Ttl::Relative(Duration::from_secs(5)))
            .build();
        let result = router.route(reply).unwrap().await;
        assert!(matches!(result, Err(DeliveryError::NotSent { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_messages() {
        let (router, _stub) = router_with(u32::MAX, fast_config().with_retry_interval(Duration::from_secs(10)));
        let ticket = router.route(one_way(Duration::from_secs(60))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        router.shutdown().await;

        assert!(matches!(ticket.await, Err(DeliveryError::Shutdown { .. })));
        assert!(matches!(
            router.route(one_way(Duration::from_secs(1))),
            Err(RouteError::Shutdown)
        ));
    }

    #[derive(Default)]
    struct Recording {
        addresses: Mutex<Vec<Address>>,
    }

    impl TransportStubFactory for Recording {
        fn can_create(&self, _address: &Address) -> bool {
            true
        }

        fn create(&self, address: &Address) -> Result<Arc<dyn MessagingStub>, StubFactoryError> {
            self.addresses.lock().push(address.clone());
            Ok(Arc::new(FlakyStub {
                failures_left: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
            }))
        }
    }

    #[derive(Default)]
    struct Processed(AtomicUsize);

    impl MessageProcessedListener for Processed {
        fn message_processed(&self, _message_id: &MessageId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn multicast_router(subscribers: &[&str]) -> (MessageRouter, Arc<Recording>) {
        let table = Arc::new(RoutingTable::new());
        for id in subscribers {
            table.put((*id).into(), Address::mqtt("tcp://b", *id), false);
        }
        let transport = Arc::new(Recording::default());
        let stubs = Arc::new(MessagingStubFactory::new().with_transport(transport.clone()));
        let router = MessageRouter::new(fast_config(), Arc::new(AddressResolver::new(table)), stubs);
        (router, transport)
    }

    fn multicast(multicast_id: &str) -> Message {
        MessageBuilder::new(MessageType::Multicast, "provider", multicast_id)
            .ttl(Ttl::Relative(Duration::from_secs(5)))
            .build()
    }

    #[tokio::test]
    async fn test_multicast_reaches_every_receiver() {
        let (router, transport) = multicast_router(&["s1", "s2", "s3"]);
        let processed = Arc::new(Processed::default());
        router.add_message_processed_listener(processed.clone());
        for id in ["s1", "s2", "s3"] {
            assert!(router.add_multicast_receiver("provider/weather", id.into()));
        }
        assert!(router.remove_multicast_receiver("provider/weather", &"s3".into()));

        router.route(multicast("provider/weather")).unwrap().await.unwrap();

        let addresses = transport.addresses.lock().clone();
        assert_eq!(addresses.len(), 2);
        assert!(addresses.contains(&Address::mqtt("tcp://b", "s1")));
        assert!(addresses.contains(&Address::mqtt("tcp://b", "s2")));
        assert_eq!(processed.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multicast_reports_failed_copy() {
        let (router, transport) = multicast_router(&["s1"]);
        router.add_multicast_receiver("provider/weather", "s1".into());
        router.add_multicast_receiver("provider/weather", "gone".into());

        let result = router.route(multicast("provider/weather")).unwrap().await;

        assert!(matches!(result, Err(DeliveryError::NotSent { .. })), "{result:?}");
        assert_eq!(
            transport.addresses.lock().as_slice(),
            &[Address::mqtt("tcp://b", "s1")]
        );
    }

    #[tokio::test]
    async fn test_multicast_without_receivers_is_not_sent() {
        let (router, transport) = multicast_router(&["s1"]);
        let result = router.route(multicast("provider/weather")).unwrap().await;
        assert!(matches!(result, Err(DeliveryError::NotSent { .. })));
        assert!(transport.addresses.lock().is_empty());
    }
}
