//! Caller- and provider-side request handling.
//!
//! The caller side registers a reply caller, builds the request envelope and
//! hands it to the [`MessageRouter`]. If delivery of the request fails, the
//! caller is resolved with that failure instead of waiting for its timeout.
//!
//! The provider side runs inbound requests through the
//! [`RequestInterpreter`]. Requests for a provider that is not registered
//! yet are parked until it registers or the request expires:
//!
//! ```text
//! handle_request(provider) ── registered? ── yes ──► interpreter.execute
//!                                  │
//!                                  no ──► pending[provider] ◄── expiry task
//!                                              │
//! register_handler(provider) ── listener ──────┘ drain ──► interpreter
//! ```

use crate::dispatch::{
    ProviderCallback, RequestCaller, RequestCallerDirectory, RequestCallerListener,
    RequestInterpreter,
};
use crate::error::{CourierError, ReplyError};
use crate::message::{
    MessageFactory, MessagingQos, OneWayRequest, ParticipantId, Reply, Request, epoch_millis,
};
use crate::messaging::{DeliveryTicket, MessageRouter};
use crate::reply::{ReplyCallerDirectory, ReplyFuture};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

enum PendingKind {
    Request {
        callback: Box<dyn ProviderCallback>,
        request: Request,
    },
    OneWay(OneWayRequest),
}

struct PendingRequest {
    kind: PendingKind,
    expiry_date_ms: u64,
}

/// Provider-side state shared with the registration listener.
struct ProviderSide {
    providers: Arc<RequestCallerDirectory>,
    interpreter: Arc<RequestInterpreter>,
    pending: Mutex<HashMap<ParticipantId, Vec<PendingRequest>>>,
    cleanup_tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_cleanup: AtomicU64,
    runtime: Handle,
}

/// Sends requests and correlates their replies, and serves inbound requests
/// to locally registered providers.
pub struct RequestReplyManager {
    router: Arc<MessageRouter>,
    reply_callers: Arc<ReplyCallerDirectory>,
    factory: MessageFactory,
    provider_side: Arc<ProviderSide>,
    shutting_down: AtomicBool,
}

impl RequestReplyManager {
    /// Create a manager over the given router, reply directory and provider
    /// registry.
    ///
    /// Must be called within a tokio runtime; spawned work lands on it.
    pub fn new(
        router: Arc<MessageRouter>,
        reply_callers: Arc<ReplyCallerDirectory>,
        providers: Arc<RequestCallerDirectory>,
    ) -> Self {
        let provider_side = Arc::new(ProviderSide {
            providers: providers.clone(),
            interpreter: Arc::new(RequestInterpreter::new()),
            pending: Mutex::new(HashMap::new()),
            cleanup_tasks: Mutex::new(HashMap::new()),
            next_cleanup: AtomicU64::new(0),
            runtime: Handle::current(),
        });
        providers.add_listener(Arc::new(PendingDrainer {
            provider_side: Arc::downgrade(&provider_side),
        }));

        Self {
            router,
            reply_callers,
            factory: MessageFactory::new(),
            provider_side,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Use `factory` to build outgoing envelopes.
    pub fn with_message_factory(mut self, factory: MessageFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Router carrying outgoing messages.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Directory of callers awaiting replies.
    pub fn reply_callers(&self) -> &Arc<ReplyCallerDirectory> {
        &self.reply_callers
    }

    /// Registry of local providers.
    pub fn providers(&self) -> &Arc<RequestCallerDirectory> {
        &self.provider_side.providers
    }

    /// Interpreter running provider methods.
    pub fn interpreter(&self) -> &Arc<RequestInterpreter> {
        &self.provider_side.interpreter
    }

    /// Envelope factory.
    pub fn message_factory(&self) -> &MessageFactory {
        &self.factory
    }

    /// Number of requests parked until their provider registers.
    pub fn pending_requests(&self) -> usize {
        self.provider_side.pending.lock().values().map(Vec::len).sum()
    }

    /// Register `provider` under `participant_id` and run any requests that
    /// were waiting for it.
    pub fn register_provider(&self, participant_id: ParticipantId, provider: RequestCaller) {
        self.provider_side.interpreter.register(&provider);
        self.provider_side
            .providers
            .register_handler(participant_id, provider);
    }

    // =========================================================================
    // Caller side
    // =========================================================================

    /// Send `request` from `from` to `to` and return a future for its reply.
    ///
    /// The future resolves exactly once: with the reply, with a timeout once
    /// `qos.round_trip_ttl` elapses, or with the delivery failure of the
    /// request.
    pub fn send_request(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        request: Request,
        qos: &MessagingQos,
    ) -> ReplyFuture {
        let request_reply_id = request.request_reply_id.clone();
        let (future, caller) = ReplyFuture::new(request_reply_id.clone());
        self.reply_callers
            .add_reply_caller(request_reply_id.clone(), Box::new(caller), qos.round_trip_ttl);

        if self.shutting_down.load(Ordering::Acquire) {
            self.reply_callers.fail(&request_reply_id, ReplyError::Shutdown);
            return future;
        }

        let message = match self.factory.create_request(from, to, &request, qos) {
            Ok(message) => message,
            Err(err) => {
                self.reply_callers.fail(&request_reply_id, err.into());
                return future;
            }
        };
        tracing::trace!(
            %request_reply_id,
            message_id = %message.id(),
            recipient = %to,
            method = %request.method_name,
            "Sending request"
        );

        match self.router.route(message) {
            Ok(ticket) => {
                let reply_callers = self.reply_callers.clone();
                self.provider_side.runtime.spawn(async move {
                    if let Err(err) = ticket.await {
                        tracing::debug!(%request_reply_id, error = %err, "Request was not delivered");
                        reply_callers.fail(&request_reply_id, err.into());
                    }
                });
            }
            Err(err) => {
                self.reply_callers.fail(&request_reply_id, err.into());
            }
        }
        future
    }

    /// Send `request` and block the current thread until its reply or
    /// timeout.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn send_sync_request(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        request: Request,
        qos: &MessagingQos,
    ) -> Result<Vec<Value>, ReplyError> {
        self.send_request(from, to, request, qos).wait_blocking()
    }

    /// Send `request` to every participant in `to`. No reply is expected.
    ///
    /// # Errors
    ///
    /// Fails on the first envelope that cannot be built or routed; envelopes
    /// routed before it stay in flight.
    pub fn send_one_way_request(
        &self,
        from: &ParticipantId,
        to: &[ParticipantId],
        request: OneWayRequest,
        qos: &MessagingQos,
    ) -> Result<Vec<DeliveryTicket>, CourierError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ReplyError::Shutdown.into());
        }
        let mut tickets = Vec::with_capacity(to.len());
        for recipient in to {
            let message = self
                .factory
                .create_one_way_request(from, recipient, &request, qos)?;
            tracing::trace!(message_id = %message.id(), %recipient, "Sending one-way request");
            tickets.push(self.router.route(message)?);
        }
        Ok(tickets)
    }

    /// Deliver an inbound reply to its waiting caller. Returns false if
    /// nobody was waiting.
    pub fn handle_reply(&self, reply: Reply) -> bool {
        self.reply_callers.message_arrived(reply)
    }

    /// Resolve the caller of `request` with `error`. Returns false if nobody
    /// was waiting.
    pub fn handle_error(&self, request: &Request, error: ReplyError) -> bool {
        self.reply_callers.fail(&request.request_reply_id, error)
    }

    // =========================================================================
    // Provider side
    // =========================================================================

    /// Run `request` on the provider registered as `provider_id`, resolving
    /// `callback` with the outcome.
    ///
    /// If no such provider is registered the request waits for it until
    /// `expiry_date_ms`, after which it is discarded.
    pub fn handle_request(
        &self,
        callback: Box<dyn ProviderCallback>,
        provider_id: &ParticipantId,
        request: Request,
        expiry_date_ms: u64,
    ) {
        if self.shutting_down.load(Ordering::Acquire) {
            callback.on_failure(ReplyError::Shutdown);
            return;
        }
        self.provider_side.dispatch(
            provider_id,
            PendingRequest {
                kind: PendingKind::Request { callback, request },
                expiry_date_ms,
            },
        );
    }

    /// Run a one-way `request` on the provider registered as `provider_id`,
    /// queuing it like [`handle_request`](Self::handle_request) does.
    pub fn handle_one_way_request(
        &self,
        provider_id: &ParticipantId,
        request: OneWayRequest,
        expiry_date_ms: u64,
    ) {
        if self.shutting_down.load(Ordering::Acquire) {
            tracing::debug!(%provider_id, "Dropping one-way request during shutdown");
            return;
        }
        self.provider_side.dispatch(
            provider_id,
            PendingRequest {
                kind: PendingKind::OneWay(request),
                expiry_date_ms,
            },
        );
    }

    /// Stop accepting requests, drop parked ones, cancel expiry timers and
    /// fail every caller still waiting for a reply.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, task) in self.provider_side.cleanup_tasks.lock().drain() {
            task.abort();
        }
        let dropped: usize = self
            .provider_side
            .pending
            .lock()
            .drain()
            .map(|(_, requests)| requests.len())
            .sum();
        self.reply_callers.shutdown();
        tracing::debug!(dropped, "Request/reply manager shut down");
    }
}

impl ProviderSide {
    fn dispatch(self: &Arc<Self>, provider_id: &ParticipantId, pending: PendingRequest) {
        let mut queued = self.pending.lock();
        // Checked under the queue lock so a registration cannot slip between
        // the lookup and the enqueue.
        if let Some(caller) = self.providers.get(provider_id) {
            drop(queued);
            self.run(&caller, pending);
            return;
        }

        let now = epoch_millis();
        if pending.expiry_date_ms <= now {
            tracing::warn!(%provider_id, "Discarding expired request for unknown provider");
            return;
        }
        tracing::debug!(%provider_id, "Provider not registered, queuing request");
        let delay = Duration::from_millis(pending.expiry_date_ms - now);
        queued.entry(provider_id.clone()).or_default().push(pending);
        drop(queued);
        self.schedule_cleanup(provider_id.clone(), delay);
    }

    fn run(&self, caller: &RequestCaller, pending: PendingRequest) {
        let _runtime = self.runtime.enter();
        match pending.kind {
            PendingKind::Request { callback, request } => {
                self.interpreter.execute(callback, caller, request)
            }
            PendingKind::OneWay(request) => self.interpreter.invoke_method(caller, request),
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, provider_id: ParticipantId, delay: Duration) {
        let key = self.next_cleanup.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        // Held across the spawn so the task cannot deregister before it is
        // inserted.
        let mut tasks = self.cleanup_tasks.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(side) = weak.upgrade() {
                side.discard_expired(&provider_id);
                side.cleanup_tasks.lock().remove(&key);
            }
        });
        tasks.insert(key, task);
    }

    fn discard_expired(&self, provider_id: &ParticipantId) {
        let now = epoch_millis();
        let mut queued = self.pending.lock();
        let Some(requests) = queued.get_mut(provider_id) else {
            return;
        };
        let before = requests.len();
        requests.retain(|pending| pending.expiry_date_ms > now);
        let discarded = before - requests.len();
        if requests.is_empty() {
            queued.remove(provider_id);
        }
        if discarded > 0 {
            tracing::warn!(%provider_id, discarded, "Queued requests expired before provider registered");
        }
    }

    fn drain(&self, provider_id: &ParticipantId, caller: &RequestCaller) {
        let requests = self.pending.lock().remove(provider_id).unwrap_or_default();
        if requests.is_empty() {
            return;
        }
        tracing::debug!(%provider_id, count = requests.len(), "Running queued requests");
        let now = epoch_millis();
        for pending in requests {
            if pending.expiry_date_ms <= now {
                tracing::warn!(%provider_id, "Discarding expired queued request");
                continue;
            }
            self.run(caller, pending);
        }
    }
}

/// Runs parked requests once their provider registers.
struct PendingDrainer {
    provider_side: Weak<ProviderSide>,
}

impl RequestCallerListener for PendingDrainer {
    fn request_caller_added(&self, participant_id: &ParticipantId, caller: &RequestCaller) {
        if let Some(side) = self.provider_side.upgrade() {
            side.drain(participant_id, caller);
        }
    }
}

impl Drop for RequestReplyManager {
    fn drop(&mut self) {
        for (_, task) in self.provider_side.cleanup_tasks.lock().drain() {
            task.abort();
        }
    }
}
