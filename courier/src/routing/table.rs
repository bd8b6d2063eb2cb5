use crate::message::{Address, ParticipantId, epoch_millis};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Routing information for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    /// Where messages for the participant are sent.
    pub address: Address,
    /// Whether the participant is reachable from other clusters.
    pub is_globally_visible: bool,
    /// Expiry date in epoch milliseconds; `u64::MAX` never expires.
    pub expiry_date_ms: u64,
    /// Sticky entries survive purges and plain removals.
    pub is_sticky: bool,
}

/// Concurrent participant → address table.
///
/// Readers and writers never block each other beyond a single shard. Each
/// participant has at most one entry, so it never points to two addresses.
///
/// # Example
///
/// ```rust,ignore
/// let table = RoutingTable::new();
/// table.put("provider-1".into(), Address::mqtt("tcp://broker", "p1"), true);
/// assert!(table.contains_key(&"provider-1".into()));
/// ```
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: DashMap<ParticipantId, RoutingEntry>,
    grace_period: Duration,
}

impl RoutingTable {
    /// Create an empty table without grace period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table that extends every finite expiry by `grace_period`.
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            grace_period,
        }
    }

    /// Insert or overwrite a non-expiring, non-sticky entry.
    pub fn put(&self, participant_id: ParticipantId, address: Address, is_globally_visible: bool) {
        self.put_with_expiry(
            participant_id,
            address,
            is_globally_visible,
            u64::MAX,
            false,
        );
    }

    /// Insert or overwrite an entry.
    ///
    /// Writing the address already stored keeps the later expiry and the
    /// stickiness of either entry. Writing a different address replaces the
    /// entry (last write wins), unless the stored entry is sticky.
    pub fn put_with_expiry(
        &self,
        participant_id: ParticipantId,
        address: Address,
        is_globally_visible: bool,
        expiry_date_ms: u64,
        is_sticky: bool,
    ) {
        let expiry_date_ms = self.with_grace(expiry_date_ms);
        match self.entries.entry(participant_id) {
            Entry::Occupied(mut occupied) => {
                let participant_id = occupied.key().clone();
                let current = occupied.get_mut();
                if current.address == address {
                    current.is_globally_visible = is_globally_visible;
                    current.expiry_date_ms = current.expiry_date_ms.max(expiry_date_ms);
                    current.is_sticky |= is_sticky;
                } else if current.is_sticky && !is_sticky {
                    tracing::warn!(
                        %participant_id,
                        current = %current.address,
                        rejected = %address,
                        "Refusing to overwrite sticky routing entry"
                    );
                } else {
                    tracing::debug!(
                        %participant_id,
                        old = %current.address,
                        new = %address,
                        "Routing entry replaced"
                    );
                    *current = RoutingEntry {
                        address,
                        is_globally_visible,
                        expiry_date_ms,
                        is_sticky,
                    };
                }
            }
            Entry::Vacant(vacant) => {
                tracing::trace!(participant_id = %vacant.key(), %address, "Routing entry added");
                vacant.insert(RoutingEntry {
                    address,
                    is_globally_visible,
                    expiry_date_ms,
                    is_sticky,
                });
            }
        }
    }

    /// Look up the address of a participant.
    pub fn get(&self, participant_id: &ParticipantId) -> Option<Address> {
        self.entries
            .get(participant_id)
            .map(|entry| entry.address.clone())
    }

    /// Look up the full entry of a participant.
    pub fn get_entry(&self, participant_id: &ParticipantId) -> Option<RoutingEntry> {
        self.entries.get(participant_id).map(|entry| entry.clone())
    }

    /// Whether the participant has an entry.
    pub fn contains_key(&self, participant_id: &ParticipantId) -> bool {
        self.entries.contains_key(participant_id)
    }

    /// Global visibility of a participant, if known.
    pub fn is_globally_visible(&self, participant_id: &ParticipantId) -> Option<bool> {
        self.entries
            .get(participant_id)
            .map(|entry| entry.is_globally_visible)
    }

    /// Remove a non-sticky entry.
    pub fn remove(&self, participant_id: &ParticipantId) -> Option<RoutingEntry> {
        self.entries
            .remove_if(participant_id, |_, entry| !entry.is_sticky)
            .map(|(_, entry)| entry)
    }

    /// Drop every expired, non-sticky entry. Returns the number removed.
    pub fn purge(&self) -> usize {
        let now = epoch_millis();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.is_sticky || entry.expiry_date_ms > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired routing entries");
        }
        removed
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn a task purging the table every `interval`.
    ///
    /// The task stops on its own once the table is dropped.
    pub fn spawn_cleanup(table: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(table);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(table) => {
                        table.purge();
                    }
                    None => break,
                }
            }
        })
    }

    fn with_grace(&self, expiry_date_ms: u64) -> u64 {
        if expiry_date_ms == u64::MAX {
            return u64::MAX;
        }
        let grace = u64::try_from(self.grace_period.as_millis()).unwrap_or(u64::MAX);
        expiry_date_ms.saturating_add(grace)
    }
}
