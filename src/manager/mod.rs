//! Manager-side services the worker leases work from.
//!
//! The HTTP surface and SQL backends live elsewhere; this module holds the
//! assignment logic and the thin store ports it runs against.

pub mod lock;
pub mod stores;

pub use lock::{lock_jobs, LockContext};
pub use stores::{
    JobsStore, MemoryJobsStore, MemoryQueuesStore, MemoryTopologyStore, QueueRow, QueuesStore,
    StaticDefinitions, TopologyStore,
};
