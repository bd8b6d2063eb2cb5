use crate::error::StubFactoryError;
use crate::message::Address;
use crate::messaging::MessagingStub;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Builds stubs for one transport kind.
pub trait TransportStubFactory: Send + Sync {
    /// Whether this factory handles `address`.
    fn can_create(&self, address: &Address) -> bool;

    /// Build a stub for `address`.
    fn create(&self, address: &Address) -> Result<Arc<dyn MessagingStub>, StubFactoryError>;
}

/// Hands out messaging stubs, caching one per address.
///
/// Addresses are compared by value, so every message for the same address
/// shares one stub until it becomes unusable or is removed. The factory owns
/// the stubs and closes them on [`shutdown`](Self::shutdown).
#[derive(Default)]
pub struct MessagingStubFactory {
    transports: Vec<Arc<dyn TransportStubFactory>>,
    stubs: DashMap<Address, Arc<dyn MessagingStub>>,
    shut_down: AtomicBool,
}

impl MessagingStubFactory {
    /// Create a factory with no transports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transport. The first transport accepting an address wins.
    pub fn with_transport(mut self, transport: Arc<dyn TransportStubFactory>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Get the cached stub for `address`, creating one if needed.
    pub fn create(&self, address: &Address) -> Result<Arc<dyn MessagingStub>, StubFactoryError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StubFactoryError::Shutdown);
        }

        if let Some(stub) = self.stubs.get(address) {
            if stub.is_usable() {
                return Ok(stub.clone());
            }
        }

        let transport = self
            .transports
            .iter()
            .find(|transport| transport.can_create(address))
            .ok_or(StubFactoryError::Unsupported {
                kind: address.kind(),
            })?;

        match self.stubs.entry(address.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_usable() {
                    return Ok(occupied.get().clone());
                }
                tracing::debug!(%address, "Replacing unusable messaging stub");
                let stub = transport.create(address)?;
                let stale = occupied.insert(stub.clone());
                stale.close();
                Ok(stub)
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(%address, kind = address.kind(), "Creating messaging stub");
                let stub = transport.create(address)?;
                vacant.insert(stub.clone());
                Ok(stub)
            }
        }
    }

    /// Drop and close the stub cached for `address`.
    pub fn remove(&self, address: &Address) {
        if let Some((_, stub)) = self.stubs.remove(address) {
            tracing::debug!(%address, "Removed messaging stub");
            stub.close();
        }
    }

    /// Number of cached stubs.
    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    /// Whether no stub is cached.
    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    /// Close every stub and refuse further lookups.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let addresses: Vec<Address> = self.stubs.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            self.remove(&address);
        }
        tracing::debug!("Messaging stub factory shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::messaging::{FailureAction, SuccessAction};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeStub {
        usable: AtomicBool,
        closed: AtomicBool,
    }

    impl MessagingStub for FakeStub {
        fn transmit(&self, _message: Arc<Message>, on_success: SuccessAction, _on_failure: FailureAction) {
            on_success();
        }

        fn is_usable(&self) -> bool {
            self.usable.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MqttOnly {
        created: AtomicUsize,
        last: parking_lot::Mutex<Option<Arc<FakeStub>>>,
    }

    impl TransportStubFactory for MqttOnly {
        fn can_create(&self, address: &Address) -> bool {
            matches!(address, Address::Mqtt { .. })
        }

        fn create(&self, _address: &Address) -> Result<Arc<dyn MessagingStub>, StubFactoryError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let stub = Arc::new(FakeStub {
                usable: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            });
            *self.last.lock() = Some(stub.clone());
            Ok(stub)
        }
    }

    #[test]
    fn test_stub_is_cached_by_address_value() {
        let transport = Arc::new(MqttOnly::default());
        let factory = MessagingStubFactory::new().with_transport(transport.clone());

        factory.create(&Address::mqtt("tcp://b", "t")).unwrap();
        factory.create(&Address::mqtt("tcp://b", "t")).unwrap();

        assert_eq!(transport.created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn test_unusable_stub_is_replaced_and_closed() {
        let transport = Arc::new(MqttOnly::default());
        let factory = MessagingStubFactory::new().with_transport(transport.clone());
        let address = Address::mqtt("tcp://b", "t");

        factory.create(&address).unwrap();
        let first = transport.last.lock().clone().unwrap();
        first.usable.store(false, Ordering::SeqCst);

        factory.create(&address).unwrap();
        assert_eq!(transport.created.load(Ordering::SeqCst), 2);
        assert!(first.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unsupported_address_kind() {
        let factory = MessagingStubFactory::new().with_transport(Arc::new(MqttOnly::default()));
        let result = factory.create(&Address::WebSocketClient { id: "c".into() });
        assert!(matches!(
            result,
            Err(StubFactoryError::Unsupported {
                kind: "websocket_client"
            })
        ));
    }

    #[test]
    fn test_shutdown_closes_stubs() {
        let transport = Arc::new(MqttOnly::default());
        let factory = MessagingStubFactory::new().with_transport(transport.clone());
        factory.create(&Address::mqtt("tcp://b", "t")).unwrap();
        let stub = transport.last.lock().clone().unwrap();

        factory.shutdown();

        assert!(stub.closed.load(Ordering::SeqCst));
        assert!(factory.is_empty());
        assert!(matches!(
            factory.create(&Address::mqtt("tcp://b", "t")),
            Err(StubFactoryError::Shutdown)
        ));
    }
}
