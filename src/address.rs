//! Per-upstream address rotation.
//!
//! An [`AddressSet`] keeps every resolved address of one upstream in
//! insertion order and hands them out round robin. Because rotation simply
//! cycles the stored order, the ratio between address families follows the
//! number of addresses of each family: two IPv4 addresses and one IPv6
//! address yield IPv4 twice as often.
//!
//! A failing address excludes its whole family for a cooldown period.
//! Exclusions lapse lazily on the next read, there is no timer behind them.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{Result, UpstreamError};

/// Network address family of a stored address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4.
    Inet,
    /// IPv6.
    Inet6,
}

impl AddressFamily {
    /// Returns the family of the given socket address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::Inet,
            SocketAddr::V6(_) => Self::Inet6,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Inet => 0,
            Self::Inet6 => 1,
        }
    }
}

/// Ordered, round-robin set of addresses belonging to one upstream.
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    addrs: Vec<SocketAddr>,
    /// Index of the next address to consider.
    cursor: usize,
    /// Index of the address most recently handed out.
    last: Option<usize>,
    /// Per-family exclusion deadline, indexed by [`AddressFamily::slot`].
    excluded_until: [Option<Instant>; 2],
}

impl AddressSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an address. The rotation cursor is left where it is.
    pub fn add_address(&mut self, addr: SocketAddr) {
        self.addrs.push(addr);
    }

    /// Returns `true` if the address is already stored.
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.addrs.contains(addr)
    }

    /// Number of stored addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Returns `true` if no address has been added yet.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Iterates over the addresses in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.addrs.iter()
    }

    /// The address returned by the latest [`next_address`](Self::next_address).
    pub fn last_returned(&self) -> Option<SocketAddr> {
        self.last.map(|idx| self.addrs[idx])
    }

    /// Excludes `family` from rotation until `now + cooldown`.
    pub fn exclude_family(&mut self, family: AddressFamily, now: Instant, cooldown: Duration) {
        self.excluded_until[family.slot()] = Some(now + cooldown);
    }

    /// Returns `true` while `family` is inside an exclusion period.
    ///
    /// An expired exclusion is cleared as a side effect.
    pub fn is_excluded(&mut self, family: AddressFamily, now: Instant) -> bool {
        let slot = &mut self.excluded_until[family.slot()];
        match *slot {
            Some(deadline) if deadline > now => true,
            Some(_) => {
                *slot = None;
                false
            }
            None => false,
        }
    }

    /// Returns the next address in rotation, skipping excluded families.
    ///
    /// When every stored address belongs to an excluded family the
    /// exclusions are ignored, so a non-empty set always yields an address.
    pub fn next_address(&mut self, now: Instant) -> Result<SocketAddr> {
        let len = self.addrs.len();
        if len == 0 {
            return Err(UpstreamError::NoAddresses(String::new()));
        }

        let inet = self.is_excluded(AddressFamily::Inet, now);
        let inet6 = self.is_excluded(AddressFamily::Inet6, now);
        let allowed = |addr: &SocketAddr| match AddressFamily::of(addr) {
            AddressFamily::Inet => !inet,
            AddressFamily::Inet6 => !inet6,
        };

        let idx = (0..len)
            .map(|offset| (self.cursor + offset) % len)
            .find(|&idx| allowed(&self.addrs[idx]))
            .unwrap_or(self.cursor % len);

        self.cursor = (idx + 1) % len;
        self.last = Some(idx);
        Ok(self.addrs[idx])
    }
}
