#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Lock-free allocation of a fixed pool of lease slots.
//!
//! All coordination goes through one versioned ledger object: a caller reads
//! it, picks a slot in memory, and writes it back conditionally on the version
//! it read. A stale write is rejected by the store and the caller starts over.

pub mod acquire;
pub mod allocator;
pub mod codec;
pub mod config;
pub mod error;
pub mod objstore;
pub mod slot;
pub mod store;
pub mod time;

pub mod test_utils;

pub use acquire::{AcquireOutcome, GrantedSlot, LeaseCoordinator, RetryPolicy};
pub use allocator::{AcquireRequest, Allocation, DEFAULT_LEASE_DURATION};
pub use error::{Error, Result};
pub use slot::{Ledger, Slot, SlotId, Version};
pub use store::{HttpObjectStore, InMemoryStore, LeaseStore, ObjectBucket, Versioned};
