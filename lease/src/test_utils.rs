use crate::{
    codec,
    objstore,
    slot::{Ledger, Slot, Version},
    store::{InMemoryStore, LeaseStore, ObjectBucket, Versioned},
    time::Timestamp,
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::Barrier;

pub const SHAPE: &str = "VM.Standard2.1";
pub const REGION: &str = "PHX-AD-1";

/// 2024-06-01T00:00:00Z, the reference "now" used across tests.
pub fn reference_now() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

/// An expiry well before [`reference_now`].
pub fn long_expired() -> Option<Timestamp> {
    Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
}

/// An expiry well after [`reference_now`].
pub fn far_future() -> Option<Timestamp> {
    Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
}

pub fn vacant_pool(count: u64) -> Vec<Slot> {
    (1..=count).map(|id| Slot::vacant(id, SHAPE, REGION)).collect()
}

/// Encoded form of `slots`, as it would sit in the store.
pub fn encoded(slots: &[Slot]) -> Bytes {
    let ledger = Ledger::new(slots.to_vec(), Version::from("unused")).unwrap();
    codec::encode(&ledger).unwrap()
}

pub fn seeded_store(slots: &[Slot]) -> InMemoryStore {
    let store = InMemoryStore::new("leases");
    store.seed(encoded(slots));
    store
}

/// Start the object-store server on an ephemeral local port.
pub async fn spawn_object_server(bucket: Arc<ObjectBucket>) -> SocketAddr {
    objstore::spawn(SocketAddr::from(([127, 0, 0, 1], 0)), bucket)
        .await
        .expect("Could not start object server")
}

/// Holds the first `racers` readers until all of them have read, so they
/// all decide against the same version and race on the commit.
#[derive(Debug)]
pub struct RacingStore {
    inner: InMemoryStore,
    barrier: Barrier,
    racers: usize,
    reads: AtomicUsize,
    puts: AtomicUsize,
}

impl RacingStore {
    pub fn new(inner: InMemoryStore, racers: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(racers),
            racers,
            reads: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseStore for RacingStore {
    async fn get(&self) -> Result<Versioned> {
        let fetched = self.inner.get().await?;
        if self.reads.fetch_add(1, Ordering::SeqCst) < self.racers {
            self.barrier.wait().await;
        }
        Ok(fetched)
    }

    async fn put(&self, content: Bytes, expected: &Version) -> Result<Version> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(content, expected).await
    }
}

/// What to do to the next `put`.
#[derive(Debug, Clone)]
pub enum PutFault {
    /// Reject with `VersionConflict` without touching the store.
    Conflict,
    /// Fail with `StoreUnavailable` without touching the store.
    Unavailable,
    /// Another writer commits this content just before the put lands.
    Interleave(Bytes),
}

/// Store wrapper that injects faults on demand and counts calls.
#[derive(Debug)]
pub struct ScriptedStore {
    inner: InMemoryStore,
    put_faults: Mutex<VecDeque<PutFault>>,
    always_conflict: AtomicBool,
    get_unavailable: AtomicBool,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl ScriptedStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            put_faults: Mutex::new(VecDeque::new()),
            always_conflict: AtomicBool::new(false),
            get_unavailable: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    /// Queue faults for the next puts, in order.
    pub fn push_faults(&self, faults: impl IntoIterator<Item = PutFault>) {
        self.put_faults.lock().extend(faults);
    }

    pub fn conflict_forever(&self) {
        self.always_conflict.store(true, Ordering::SeqCst);
    }

    pub fn fail_gets(&self) {
        self.get_unavailable.store(true, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseStore for ScriptedStore {
    async fn get(&self) -> Result<Versioned> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.get_unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable {
                reason: "injected outage".into(),
            });
        }
        self.inner.get().await
    }

    async fn put(&self, content: Bytes, expected: &Version) -> Result<Version> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.always_conflict.load(Ordering::SeqCst) {
            return Err(Error::VersionConflict {
                expected: expected.clone(),
            });
        }

        let fault = self.put_faults.lock().pop_front();
        match fault {
            None => self.inner.put(content, expected).await,
            Some(PutFault::Conflict) => Err(Error::VersionConflict {
                expected: expected.clone(),
            }),
            Some(PutFault::Unavailable) => Err(Error::StoreUnavailable {
                reason: "injected outage".into(),
            }),
            Some(PutFault::Interleave(theirs)) => {
                self.inner.seed(theirs);
                self.inner.put(content, expected).await
            }
        }
    }
}
