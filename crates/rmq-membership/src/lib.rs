//! RedisMQ Cluster Membership
//!
//! Consumer clients coordinate through the shared store only:
//!
//! - **Registry**: each client refreshes a heartbeat score in the membership
//!   set; members older than the staleness threshold are considered dead.
//! - **Cleanup**: any client may purge stale members, guarded by a short
//!   SET NX lock so one client does it per window.
//! - **Rebalance**: a pure function of the live-client set. Every client
//!   computes the same assignment independently, no negotiation.

mod error;
mod rebalance;
mod registry;

pub use error::{MembershipError, Result};
pub use rebalance::{assign_all, rebalance, Assignment};
pub use registry::ClientRegistry;
