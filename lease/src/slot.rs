use std::collections::HashSet;
use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{time::Timestamp, Error, Result};

/// Stable identity of a slot, assigned when the ledger is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token issued by the store for one committed ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for Version {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// One leasable unit of capacity.
///
/// `id`, `shape` and `region` are fixed when the ledger is provisioned. The
/// holder fields only mean something while `tenant` is present; a vacant slot
/// may still carry a stale build number or expiry from an older format and
/// those values are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    id: SlotId,
    shape: String,
    region: String,
    tenant: Option<String>,
    build_number: u64,
    expiry: Option<Timestamp>,
}

impl Slot {
    pub fn vacant(id: u64, shape: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: SlotId(id),
            shape: shape.into(),
            region: region.into(),
            tenant: None,
            build_number: 0,
            expiry: None,
        }
    }

    /// Slot already held by `tenant`, as it would appear in a provisioned ledger.
    /// An empty tenant leaves the slot vacant.
    pub fn leased(
        id: u64,
        shape: impl Into<String>,
        region: impl Into<String>,
        tenant: impl Into<String>,
        build_number: u64,
        expiry: Option<Timestamp>,
    ) -> Self {
        Self {
            tenant: Some(tenant.into()).filter(|tenant| !tenant.is_empty()),
            build_number,
            expiry,
            ..Self::vacant(id, shape, region)
        }
    }

    /// Slot in any state. An empty tenant is stored as absent.
    pub fn new(
        id: SlotId,
        shape: String,
        region: String,
        tenant: Option<String>,
        build_number: u64,
        expiry: Option<Timestamp>,
    ) -> Self {
        Self {
            id,
            shape,
            region,
            tenant: tenant.filter(|tenant| !tenant.is_empty()),
            build_number,
            expiry,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn shape(&self) -> &str {
        &self.shape
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn build_number(&self) -> u64 {
        self.build_number
    }

    pub fn expiry(&self) -> Option<Timestamp> {
        self.expiry
    }

    pub fn is_vacant(&self) -> bool {
        self.tenant.is_none()
    }

    /// A held slot is expired once its expiry lies strictly before `now`.
    /// A held slot without an expiry never expires.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        !self.is_vacant() && self.expiry.is_some_and(|expiry| expiry < now)
    }

    /// Hand the slot to a new holder. Identity fields stay as they are.
    pub(crate) fn assign(&mut self, tenant: &str, build_number: u64, expiry: Timestamp) {
        self.tenant = Some(tenant.to_string());
        self.build_number = build_number;
        self.expiry = Some(expiry);
    }

    /// Time left on the lease, `None` when vacant, expired, or open-ended.
    pub fn time_remaining(&self, now: Timestamp) -> Option<Duration> {
        match (self.tenant.as_ref(), self.expiry) {
            (Some(_), Some(expiry)) if expiry > now => Some(expiry - now),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} @ {}: ", self.id, self.shape, self.region)?;
        match &self.tenant {
            None => write!(f, "vacant"),
            Some(tenant) => {
                write!(f, "{} (build {})", tenant, self.build_number)?;
                match self.expiry {
                    Some(expiry) => write!(f, " until {}", expiry.to_rfc3339()),
                    None => write!(f, " with no expiry"),
                }
            }
        }
    }
}

/// The full slot pool together with the version it was read at.
///
/// There is no way to swap the version independently of the content, so a
/// ledger always writes back against the version its own slots came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    slots: Vec<Slot>,
    version: Version,
}

impl Ledger {
    pub fn new(slots: Vec<Slot>, version: Version) -> Result<Self> {
        let mut seen = HashSet::with_capacity(slots.len());
        for slot in &slots {
            if !seen.insert(slot.id) {
                return Err(Error::InvalidRequest(format!(
                    "duplicate slot id {} in ledger",
                    slot.id
                )));
            }
        }
        Ok(Self { slots, version })
    }

    /// Caller has already checked id uniqueness.
    pub(crate) fn from_checked(slots: Vec<Slot>, version: Version) -> Self {
        Self { slots, version }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn vacancies(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_vacant()).count()
    }
}
