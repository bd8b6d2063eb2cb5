//! Routing table and address resolution.
//!
//! The [`RoutingTable`] maps participants to transport addresses. The
//! [`AddressResolver`] answers lookups from the table and, in a hierarchical
//! deployment, asks a [`ParentRouter`] for participants it does not know.

mod parent;
mod resolver;
mod table;

pub use parent::{NextHop, ParentRouter};
pub use resolver::{AddressResolver, DEFAULT_PARENT_RESOLUTION_TIMEOUT};
pub use table::{RoutingEntry, RoutingTable};
