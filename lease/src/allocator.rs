// Slot selection. Pure over its inputs: no I/O, no clock reads.

use std::time::Duration;

use tracing::info;

use crate::{codec, slot::Ledger, time::Timestamp, Error, Result};

/// Default lease length (3 hours)
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(3 * 60 * 60);

/// Who wants a slot and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    pub tenant: String,
    pub build_number: u64,
    pub lease_duration: Duration,
}

impl AcquireRequest {
    pub fn new(tenant: impl Into<String>, build_number: u64) -> Self {
        Self {
            tenant: tenant.into(),
            build_number,
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// An empty tenant would read back as a vacancy, and separators would
    /// corrupt the stored ledger.
    pub fn validate(&self) -> Result<()> {
        if self.tenant.is_empty() {
            return Err(Error::InvalidRequest("tenant must not be empty".into()));
        }
        if self.tenant.contains(&[',', '\n', '\r'][..]) {
            return Err(Error::InvalidRequest(format!(
                "tenant {:?} contains a separator",
                self.tenant
            )));
        }
        chrono::Duration::from_std(self.lease_duration).map_err(|_| {
            Error::InvalidRequest(format!(
                "lease duration {:?} is out of range",
                self.lease_duration
            ))
        })?;
        Ok(())
    }
}

/// What the allocator did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// A slot without a tenant was taken.
    Vacancy { index: usize },
    /// An expired lease was overwritten.
    Eviction { index: usize, evicted: String },
    /// Nothing was free; the ledger was not touched.
    Exhausted,
}

impl Allocation {
    /// Ledger position of the slot that was assigned.
    pub fn index(&self) -> Option<usize> {
        match self {
            Allocation::Vacancy { index } | Allocation::Eviction { index, .. } => Some(*index),
            Allocation::Exhausted => None,
        }
    }
}

/// Pick one slot for `request` and assign it in place.
///
/// Any vacancy beats any eviction. Within each pass the earliest slot in
/// ledger order wins. Only the chosen slot's tenant, build number and expiry
/// change.
pub fn allocate(ledger: &mut Ledger, request: &AcquireRequest, now: Timestamp) -> Result<Allocation> {
    request.validate()?;

    let allocation = select(ledger, now);
    let (index, evicted) = match &allocation {
        Allocation::Vacancy { index } => (*index, None),
        Allocation::Eviction { index, evicted } => (*index, Some(evicted.as_str())),
        Allocation::Exhausted => return Ok(allocation),
    };

    let duration = chrono::Duration::from_std(request.lease_duration)
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let expiry = now
        .checked_add_signed(duration)
        .filter(|expiry| codec::is_encodable(*expiry))
        .ok_or_else(|| {
            Error::InvalidRequest(format!(
                "lease duration {:?} puts the expiry past year 9999",
                request.lease_duration
            ))
        })?;

    let slot = &mut ledger.slots_mut()[index];
    match evicted {
        None => info!("found a vacancy in slot {}", slot.id()),
        Some(previous) => info!(
            "found an expired lease, evicting {} from slot {}",
            previous,
            slot.id()
        ),
    }
    slot.assign(&request.tenant, request.build_number, expiry);

    Ok(allocation)
}

fn select(ledger: &Ledger, now: Timestamp) -> Allocation {
    let slots = ledger.slots();

    if let Some(index) = slots.iter().position(|slot| slot.is_vacant()) {
        return Allocation::Vacancy { index };
    }

    slots
        .iter()
        .enumerate()
        .find(|(_, slot)| slot.is_expired(now))
        .map_or(Allocation::Exhausted, |(index, slot)| Allocation::Eviction {
            index,
            evicted: slot.tenant().unwrap_or_default().to_string(),
        })
}
