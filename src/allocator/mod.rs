//! Private address allocation for the cluster VLAN.
//!
//! Addresses come from a fixed inclusive range and are handed out lowest
//! first. The allocator is shared by every concurrent provisioning run, so
//! the held set sits behind a mutex; on startup it is seeded from persisted
//! resource state so restarts never hand out an address twice.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

/// First address of the default pool.
pub const POOL_FIRST: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);

/// Last address of the default pool.
pub const POOL_LAST: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 127);

/// Errors raised by [`PrivateIpAllocator`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AllocatorError {
    /// Every address in the range is held.
    #[error("no available IP addresses in range {first}-{last}")]
    Exhausted {
        /// First address of the range.
        first: Ipv4Addr,
        /// Last address of the range.
        last: Ipv4Addr,
    },
    /// The range bounds are reversed.
    #[error("invalid address range {first}-{last}")]
    InvalidRange {
        /// Requested first address.
        first: Ipv4Addr,
        /// Requested last address.
        last: Ipv4Addr,
    },
}

/// Thread-safe allocator over an inclusive IPv4 range.
#[derive(Debug)]
pub struct PrivateIpAllocator {
    first: u32,
    last: u32,
    in_use: Mutex<BTreeSet<Ipv4Addr>>,
}

impl Default for PrivateIpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivateIpAllocator {
    /// Creates an allocator over `10.1.0.2`..=`10.1.0.127`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            first: u32::from(POOL_FIRST),
            last: u32::from(POOL_LAST),
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Creates an allocator over a custom inclusive range.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::InvalidRange`] when `first > last`.
    pub fn with_range(first: Ipv4Addr, last: Ipv4Addr) -> Result<Self, AllocatorError> {
        if u32::from(first) > u32::from(last) {
            return Err(AllocatorError::InvalidRange { first, last });
        }
        Ok(Self {
            first: u32::from(first),
            last: u32::from(last),
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    /// Hands out the lowest free address and marks it held.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Exhausted`] when the whole range is held.
    pub fn acquire(&self) -> Result<Ipv4Addr, AllocatorError> {
        let mut in_use = self.lock();
        let free = (self.first..=self.last)
            .map(Ipv4Addr::from)
            .find(|candidate| !in_use.contains(candidate));
        let Some(addr) = free else {
            return Err(AllocatorError::Exhausted {
                first: Ipv4Addr::from(self.first),
                last: Ipv4Addr::from(self.last),
            });
        };
        in_use.insert(addr);
        debug!(address = %addr, "private address acquired");
        Ok(addr)
    }

    /// Returns `addr` to the pool. Releasing an address that is not held is
    /// a no-op.
    pub fn release(&self, addr: Ipv4Addr) {
        if self.lock().remove(&addr) {
            debug!(address = %addr, "private address released");
        }
    }

    /// Marks `addr` held without searching. Returns `false` when the address
    /// lies outside the range or was already held.
    pub fn reserve(&self, addr: Ipv4Addr) -> bool {
        if !self.contains(addr) {
            return false;
        }
        self.lock().insert(addr)
    }

    /// Marks every in-range address from `addrs` held and returns how many
    /// were newly reserved.
    pub fn seed<I>(&self, addrs: I) -> usize
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let mut in_use = self.lock();
        addrs
            .into_iter()
            .filter(|addr| (self.first..=self.last).contains(&u32::from(*addr)))
            .filter(|addr| in_use.insert(*addr))
            .count()
    }

    /// Returns `true` when `addr` is currently held.
    #[must_use]
    pub fn is_held(&self, addr: Ipv4Addr) -> bool {
        self.lock().contains(&addr)
    }

    /// Snapshot of held addresses in ascending order.
    #[must_use]
    pub fn in_use(&self) -> Vec<Ipv4Addr> {
        self.lock().iter().copied().collect()
    }

    fn contains(&self, addr: Ipv4Addr) -> bool {
        (self.first..=self.last).contains(&u32::from(addr))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<Ipv4Addr>> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
