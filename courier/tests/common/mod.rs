//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use courier::{
    Address, Dispatcher, FailureAction, Message, MessageFactory, MessageRouter, MessagingConfig,
    MessagingStub, MessagingStubFactory, MethodTable, NextHop, ParentRouter, ParentRouterError,
    ParticipantId, Provider, ProviderError, ReplyCallerDirectory, RequestCaller,
    RequestCallerDirectory, RequestReplyManager, RoutingTable, StubFactoryError, SuccessAction,
    TransmitError, TransportStubFactory,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const PROXY: &str = "proxy";
pub const PROVIDER: &str = "provider";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn in_process(participant_id: &str) -> Address {
    Address::InProcess {
        participant_id: participant_id.into(),
    }
}

// =============================================================================
// Stubs
// =============================================================================

/// Stub failing a configurable number of times before succeeding.
pub struct FlakyStub {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    attempted_at: parking_lot::Mutex<Vec<Instant>>,
}

impl FlakyStub {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            attempted_at: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each transmission was attempted, in order.
    pub fn attempted_at(&self) -> Vec<Instant> {
        self.attempted_at.lock().clone()
    }
}

impl MessagingStub for FlakyStub {
    fn transmit(&self, _message: Arc<Message>, on_success: SuccessAction, on_failure: FailureAction) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempted_at.lock().push(Instant::now());
        let decremented = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if decremented.is_ok() {
            on_failure(TransmitError::Retryable("connection refused".into()));
        } else {
            on_success();
        }
    }
}

/// Hands out one shared stub for every address.
pub struct SingleStubTransport(pub Arc<dyn MessagingStub>);

impl TransportStubFactory for SingleStubTransport {
    fn can_create(&self, _address: &Address) -> bool {
        true
    }

    fn create(&self, _address: &Address) -> Result<Arc<dyn MessagingStub>, StubFactoryError> {
        Ok(self.0.clone())
    }
}

/// Stub pushing messages into the local inbound channel.
pub struct LoopbackStub {
    inbound: mpsc::UnboundedSender<Message>,
}

impl MessagingStub for LoopbackStub {
    fn transmit(&self, message: Arc<Message>, on_success: SuccessAction, on_failure: FailureAction) {
        match self.inbound.send(Message::clone(&message)) {
            Ok(()) => on_success(),
            Err(_) => on_failure(TransmitError::Closed),
        }
    }
}

/// Creates loopback stubs for in-process addresses.
pub struct LoopbackTransport {
    inbound: mpsc::UnboundedSender<Message>,
}

impl TransportStubFactory for LoopbackTransport {
    fn can_create(&self, address: &Address) -> bool {
        matches!(address, Address::InProcess { .. })
    }

    fn create(&self, _address: &Address) -> Result<Arc<dyn MessagingStub>, StubFactoryError> {
        Ok(Arc::new(LoopbackStub {
            inbound: self.inbound.clone(),
        }))
    }
}

// =============================================================================
// Parent router
// =============================================================================

/// Parent router that knows a fixed set of participants and answers slowly.
pub struct CountingParent {
    pub known: Vec<ParticipantId>,
    pub delay: Duration,
    pub resolve_calls: AtomicUsize,
    pub added: parking_lot::Mutex<Vec<ParticipantId>>,
}

impl CountingParent {
    pub fn new(known: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            known: known.iter().map(|id| ParticipantId::new(*id)).collect(),
            delay,
            resolve_calls: AtomicUsize::new(0),
            added: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParentRouter for CountingParent {
    async fn resolve_next_hop(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<NextHop, ParentRouterError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(NextHop {
            resolved: self.known.contains(participant_id),
            is_globally_visible: true,
        })
    }

    async fn add_next_hop(
        &self,
        participant_id: &ParticipantId,
        _address: &Address,
        _is_globally_visible: bool,
    ) -> Result<(), ParentRouterError> {
        self.added.lock().push(participant_id.clone());
        Ok(())
    }

    async fn remove_next_hop(
        &self,
        _participant_id: &ParticipantId,
    ) -> Result<(), ParentRouterError> {
        Ok(())
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Test provider for the `test/Echo` interface.
pub struct EchoProvider {
    pub calls: AtomicUsize,
}

impl EchoProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

impl Provider for EchoProvider {
    const INTERFACE_NAME: &'static str = "test/Echo";

    fn method_table() -> MethodTable {
        MethodTable::builder::<Self>(Self::INTERFACE_NAME)
            .method1("echoString", "String", |this, input: String| async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            })
            .method2(
                "delayedEcho",
                ["String", "Long"],
                |this, input: String, delay_ms: u64| async move {
                    this.calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    Ok(input)
                },
            )
            .method1("fail", "String", |_this, reason: String| async move {
                Err::<(), _>(ProviderError::application("EchoRejected", reason))
            })
            .method0("ping", |_this| async move { Ok("pong".to_string()) })
            .method1("notify", "String", |this, _event: String| async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
    }
}

// =============================================================================
// Node
// =============================================================================

/// A complete stack where proxy and provider live in the same process and
/// talk through a loopback transport.
pub struct Node {
    pub table: Arc<RoutingTable>,
    pub router: Arc<MessageRouter>,
    pub manager: Arc<RequestReplyManager>,
    pub dispatcher: Dispatcher,
}

impl Node {
    pub fn new(config: MessagingConfig) -> Self {
        let (inbound, inbound_rx) = mpsc::unbounded_channel::<Message>();
        let node = Self::wired(config, inbound, inbound_rx, MessageFactory::new());
        node.table.put(PROXY.into(), in_process(PROXY), false);
        node.table.put(PROVIDER.into(), in_process(PROVIDER), false);
        node
    }

    /// Two nodes whose loopback transports deliver into each other.
    ///
    /// Both routing tables start empty. Requests from the first node carry
    /// `caller_factory`'s reply-to address, if any.
    pub fn pair(config: MessagingConfig, caller_factory: MessageFactory) -> (Self, Self) {
        let (to_caller, caller_rx) = mpsc::unbounded_channel::<Message>();
        let (to_provider, provider_rx) = mpsc::unbounded_channel::<Message>();
        let caller = Self::wired(config.clone(), to_provider, caller_rx, caller_factory);
        let provider = Self::wired(config, to_caller, provider_rx, MessageFactory::new());
        (caller, provider)
    }

    /// A stack whose transport sends into `outbound` and whose dispatcher
    /// drains `inbound_rx`.
    fn wired(
        config: MessagingConfig,
        outbound: mpsc::UnboundedSender<Message>,
        mut inbound_rx: mpsc::UnboundedReceiver<Message>,
        factory: MessageFactory,
    ) -> Self {
        let table = Arc::new(RoutingTable::new());
        let resolver = Arc::new(courier::AddressResolver::new(table.clone()));
        let stubs = Arc::new(
            MessagingStubFactory::new()
                .with_transport(Arc::new(LoopbackTransport { inbound: outbound })),
        );
        let router = Arc::new(MessageRouter::new(config, resolver, stubs));
        let manager = Arc::new(
            RequestReplyManager::new(
                router.clone(),
                Arc::new(ReplyCallerDirectory::new()),
                Arc::new(RequestCallerDirectory::new()),
            )
            .with_message_factory(factory),
        );
        let dispatcher = Dispatcher::new(manager.clone());

        let pump = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                pump.message_arrived(message);
            }
        });

        Self {
            table,
            router,
            manager,
            dispatcher,
        }
    }

    pub fn register_echo(&self) -> Arc<EchoProvider> {
        let provider = EchoProvider::new();
        self.manager
            .register_provider(PROVIDER.into(), RequestCaller::new(provider.clone()));
        provider
    }
}
