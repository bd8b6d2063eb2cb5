//! Participant → address resolution with parent delegation.
//!
//! # Coalescing
//!
//! ```text
//! resolve(p) ──► table hit? ──yes──► address
//!                   │ no
//!                   ▼
//!        in_flight[p] exists? ──yes──► wait on shared result
//!                   │ no
//!                   ▼
//!        insert in_flight[p], spawn one parent call
//!                   │
//!   parent answers ─┴─► install route, wake every waiter, clear in_flight[p]
//!   or deadline hits
//! ```
//!
//! The upstream call runs in its own task so a cancelled caller never leaves
//! the other waiters hanging, and lookups of unrelated participants never
//! wait on it. The call is bounded by the parent resolution timeout, and
//! `in_flight[p]` is cleared when the task ends for any reason, panics
//! included, so the next lookup asks the parent again.

use crate::error::{ParentRouterError, RoutingError};
use crate::message::{Address, ParticipantId};
use crate::routing::{NextHop, ParentRouter, RoutingTable};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Deadline for one parent lookup unless configured otherwise.
pub const DEFAULT_PARENT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);

type Waiters = Vec<oneshot::Sender<Result<Address, RoutingError>>>;
type InFlight = Arc<Mutex<HashMap<ParticipantId, Waiters>>>;

#[derive(Clone)]
struct ParentLink {
    router: Arc<dyn ParentRouter>,
    /// How this node reaches the parent.
    parent_address: Address,
    /// How the parent reaches this node.
    incoming_address: Address,
}

/// Resolves participants to addresses, asking a parent router on misses.
pub struct AddressResolver {
    table: Arc<RoutingTable>,
    parent: RwLock<Option<ParentLink>>,
    in_flight: InFlight,
    /// Hops registered before the parent was known, or not yet accepted by it.
    /// Lock this before `parent` when both are needed.
    deferred_hops: Mutex<Vec<(ParticipantId, bool)>>,
    defer_until_parent: bool,
    parent_timeout: Duration,
}

impl AddressResolver {
    /// Resolver of a root node: no parent, hops are never deferred.
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self {
            table,
            parent: RwLock::new(None),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            deferred_hops: Mutex::new(Vec::new()),
            defer_until_parent: false,
            parent_timeout: DEFAULT_PARENT_RESOLUTION_TIMEOUT,
        }
    }

    /// Bound every parent lookup by `timeout`.
    ///
    /// Usually taken from
    /// [`MessagingConfig::parent_resolution_timeout`](crate::MessagingConfig::parent_resolution_timeout).
    pub fn with_parent_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.parent_timeout = timeout;
        self
    }

    /// Resolver of a child node whose parent is configured later.
    ///
    /// Hops added before [`set_parent_router`](Self::set_parent_router) are
    /// announced to the parent once it is set.
    pub fn child(table: Arc<RoutingTable>) -> Self {
        Self {
            defer_until_parent: true,
            ..Self::new(table)
        }
    }

    /// The underlying routing table.
    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Whether a parent router is configured.
    pub fn has_parent(&self) -> bool {
        self.parent.read().is_some()
    }

    /// Configure the parent router and flush deferred hops to it.
    ///
    /// If the parent rejects a hop, that hop and every hop after it stay
    /// deferred and are announced by the next call.
    pub async fn set_parent_router(
        &self,
        router: Arc<dyn ParentRouter>,
        parent_address: Address,
        incoming_address: Address,
    ) -> Result<(), RoutingError> {
        let link = ParentLink {
            router,
            parent_address,
            incoming_address,
        };
        let deferred = {
            let mut deferred = self.deferred_hops.lock();
            *self.parent.write() = Some(link.clone());
            std::mem::take(&mut *deferred)
        };
        tracing::debug!(
            deferred = deferred.len(),
            "Parent router set, announcing deferred hops"
        );

        let mut remaining = deferred.into_iter();
        while let Some((participant_id, is_globally_visible)) = remaining.next() {
            let announced = link
                .router
                .add_next_hop(&participant_id, &link.incoming_address, is_globally_visible)
                .await;
            if let Err(err) = announced {
                tracing::warn!(%participant_id, error = %err, "Parent rejected deferred hop");
                let mut deferred = self.deferred_hops.lock();
                let added_meanwhile = std::mem::take(&mut *deferred);
                deferred.push((participant_id, is_globally_visible));
                deferred.extend(remaining);
                deferred.extend(added_meanwhile);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Resolve `participant_id` to an address.
    ///
    /// Local entries answer immediately. Otherwise the parent, if any, is
    /// asked once per participant no matter how many callers are waiting.
    pub async fn resolve(&self, participant_id: &ParticipantId) -> Result<Address, RoutingError> {
        if let Some(address) = self.table.get(participant_id) {
            return Ok(address);
        }

        let link = self.parent.read().clone();
        let Some(link) = link else {
            return Err(RoutingError::NoRoute(participant_id.clone()));
        };

        let (receiver, leader) = {
            let mut in_flight = self.in_flight.lock();
            // A parent answer may have landed between the first lookup and the lock.
            if let Some(address) = self.table.get(participant_id) {
                return Ok(address);
            }
            let (tx, rx) = oneshot::channel();
            match in_flight.get_mut(participant_id) {
                Some(waiters) => {
                    tracing::trace!(%participant_id, "Joining in-flight parent resolution");
                    waiters.push(tx);
                    (rx, false)
                }
                None => {
                    in_flight.insert(participant_id.clone(), vec![tx]);
                    (rx, true)
                }
            }
        };
        // Spawned outside the lock: a rejected spawn drops the completion, which takes it.
        if leader {
            self.spawn_parent_resolution(participant_id.clone(), link);
        }

        receiver.await.unwrap_or_else(|_| Err(abandoned()))
    }

    fn spawn_parent_resolution(&self, participant_id: ParticipantId, link: ParentLink) {
        let table = self.table.clone();
        let timeout = self.parent_timeout;
        let mut completion = Completion {
            in_flight: self.in_flight.clone(),
            participant_id,
            result: None,
        };
        tokio::spawn(async move {
            let participant_id = completion.participant_id.clone();
            tracing::debug!(%participant_id, "Resolving participant through parent router");
            let answer = tokio::time::timeout(timeout, link.router.resolve_next_hop(&participant_id))
                .await
                .unwrap_or(Err(ParentRouterError::Timeout));
            let result = match answer {
                Ok(NextHop {
                    resolved: true,
                    is_globally_visible,
                }) => {
                    table.put(
                        participant_id.clone(),
                        link.parent_address.clone(),
                        is_globally_visible,
                    );
                    Ok(link.parent_address.clone())
                }
                Ok(_) => Err(RoutingError::NoRoute(participant_id.clone())),
                Err(err) => {
                    tracing::warn!(%participant_id, error = %err, "Parent resolution failed");
                    Err(RoutingError::Parent(err))
                }
            };
            completion.result = Some(result);
        });
    }

    /// Register a locally reachable participant and announce it upstream.
    pub async fn add_next_hop(
        &self,
        participant_id: ParticipantId,
        address: Address,
        is_globally_visible: bool,
    ) -> Result<(), RoutingError> {
        self.table
            .put(participant_id.clone(), address, is_globally_visible);

        let link = {
            // Checked and deferred atomically with respect to set_parent_router.
            let mut deferred = self.deferred_hops.lock();
            let link = self.parent.read().clone();
            if link.is_none() && self.defer_until_parent {
                tracing::trace!(%participant_id, "Deferring next hop until parent is set");
                deferred.push((participant_id.clone(), is_globally_visible));
            }
            link
        };
        if let Some(link) = link {
            link.router
                .add_next_hop(&participant_id, &link.incoming_address, is_globally_visible)
                .await?;
        }
        Ok(())
    }

    /// Forget a participant locally and upstream.
    pub async fn remove_next_hop(&self, participant_id: &ParticipantId) -> Result<(), RoutingError> {
        self.table.remove(participant_id);
        self.deferred_hops
            .lock()
            .retain(|(deferred, _)| deferred != participant_id);

        let link = self.parent.read().clone();
        if let Some(link) = link {
            link.router.remove_next_hop(participant_id).await?;
        }
        Ok(())
    }
}

fn abandoned() -> RoutingError {
    RoutingError::Parent(ParentRouterError::Unavailable(
        "parent resolution abandoned".to_string(),
    ))
}

/// Clears `in_flight[p]` and wakes its waiters when the resolution task ends.
///
/// Runs on drop so a panicking parent router still releases the entry.
struct Completion {
    in_flight: InFlight,
    participant_id: ParticipantId,
    result: Option<Result<Address, RoutingError>>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| Err(abandoned()));
        let waiters = self
            .in_flight
            .lock()
            .remove(&self.participant_id)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
