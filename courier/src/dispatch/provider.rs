use crate::dispatch::MethodTable;
use crate::dispatch::method::SharedHandler;
use crate::message::ParticipantId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

/// A type whose instances can serve requests.
pub trait Provider: Send + Sync + 'static {
    /// Interface name callers address, e.g. `"radio/RadioStation"`.
    const INTERFACE_NAME: &'static str;

    /// Describe the callable methods. Called once per type.
    fn method_table() -> MethodTable
    where
        Self: Sized;
}

/// A registered provider instance, ready for dispatch.
#[derive(Clone)]
pub struct RequestCaller {
    interface_name: &'static str,
    handler_type: TypeId,
    handler_type_name: &'static str,
    handler: SharedHandler,
    build_table: fn() -> MethodTable,
}

impl RequestCaller {
    /// Wrap a provider instance.
    pub fn new<P: Provider>(provider: Arc<P>) -> Self {
        Self {
            interface_name: P::INTERFACE_NAME,
            handler_type: TypeId::of::<P>(),
            handler_type_name: std::any::type_name::<P>(),
            handler: provider,
            build_table: P::method_table,
        }
    }

    /// Interface the provider implements.
    pub fn interface_name(&self) -> &'static str {
        self.interface_name
    }

    /// Rust type name of the provider, for logs.
    pub fn handler_type_name(&self) -> &'static str {
        self.handler_type_name
    }

    pub(crate) fn handler_type(&self) -> TypeId {
        self.handler_type
    }

    pub(crate) fn handler(&self) -> SharedHandler {
        self.handler.clone()
    }

    pub(crate) fn build_table(&self) -> MethodTable {
        (self.build_table)()
    }
}

impl fmt::Debug for RequestCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCaller")
            .field("interface_name", &self.interface_name)
            .field("handler_type", &self.handler_type_name)
            .finish()
    }
}

/// Observer of provider registrations.
pub trait RequestCallerListener: Send + Sync {
    /// `caller` was registered for `participant_id`.
    fn request_caller_added(&self, participant_id: &ParticipantId, caller: &RequestCaller);
}

/// Registry of locally hosted providers.
#[derive(Default)]
pub struct RequestCallerDirectory {
    callers: DashMap<ParticipantId, RequestCaller>,
    listeners: RwLock<Vec<Arc<dyn RequestCallerListener>>>,
}

impl RequestCallerDirectory {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `caller` under `participant_id`, replacing any previous one,
    /// and notify listeners.
    pub fn register_handler(&self, participant_id: ParticipantId, caller: RequestCaller) {
        tracing::debug!(
            %participant_id,
            interface = caller.interface_name(),
            "Registering request caller"
        );
        self.callers.insert(participant_id.clone(), caller.clone());
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.request_caller_added(&participant_id, &caller);
        }
    }

    /// Remove the provider registered under `participant_id`.
    pub fn remove_handler(&self, participant_id: &ParticipantId) -> Option<RequestCaller> {
        let removed = self.callers.remove(participant_id).map(|(_, caller)| caller);
        if removed.is_some() {
            tracing::debug!(%participant_id, "Removed request caller");
        }
        removed
    }

    /// Provider registered under `participant_id`.
    pub fn get(&self, participant_id: &ParticipantId) -> Option<RequestCaller> {
        self.callers.get(participant_id).map(|caller| caller.clone())
    }

    /// Whether a provider is registered under `participant_id`.
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.callers.contains_key(participant_id)
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.callers.len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    /// Observe future registrations.
    pub fn add_listener(&self, listener: Arc<dyn RequestCallerListener>) {
        self.listeners.write().push(listener);
    }
}
