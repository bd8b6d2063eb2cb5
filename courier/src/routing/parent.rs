use crate::error::ParentRouterError;
use crate::message::{Address, ParticipantId};
use async_trait::async_trait;

/// Outcome of a parent resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    /// Whether the parent knows the participant.
    pub resolved: bool,
    /// Whether the participant is globally visible.
    pub is_globally_visible: bool,
}

/// Proxy to the routing node one level up in a hierarchical deployment.
///
/// A child node forwards lookups it cannot answer to its parent and
/// announces its own participants so the parent can route to them.
#[async_trait]
pub trait ParentRouter: Send + Sync {
    /// Ask whether the parent can route to `participant_id`.
    async fn resolve_next_hop(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<NextHop, ParentRouterError>;

    /// Tell the parent that `participant_id` is reachable at `address`.
    async fn add_next_hop(
        &self,
        participant_id: &ParticipantId,
        address: &Address,
        is_globally_visible: bool,
    ) -> Result<(), ParentRouterError>;

    /// Tell the parent that `participant_id` is gone.
    async fn remove_next_hop(&self, participant_id: &ParticipantId)
    -> Result<(), ParentRouterError>;
}
