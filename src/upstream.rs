//! Upstreams and the pools that own them.
//!
//! An [`UpstreamPool`] is an ordered list of [`Upstream`]s plus the health
//! policy they share. Order is fixed at construction: it is the priority
//! order for master/slave selection and the tie-break order for every other
//! rotation.
//!
//! Nothing here locks. The pool is meant to be owned by a single scheduling
//! context and every mutating call takes `&mut self`; callers sharing a pool
//! across threads must serialize access themselves.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::address::{AddressFamily, AddressSet};
use crate::balancer::{self, Rotation};
use crate::config::{parse_server_entry, split_server_line, validate_host};
use crate::health::{HealthState, HealthTracker, UpstreamLimits};
use crate::{Result, UpstreamError};

/// Stable handle to an upstream inside its pool: the insertion index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamId(pub usize);

/// One backend server candidate.
#[derive(Debug, Clone)]
pub struct Upstream {
    name: String,
    port: u16,
    weight: u32,
    index: usize,
    limits: UpstreamLimits,
    addrs: AddressSet,
    health: HealthTracker,
    /// Smooth round-robin credit, owned by [`balancer::round_robin`].
    pub(crate) credit: i64,
}

impl Upstream {
    pub(crate) fn new(
        name: &str,
        port: u16,
        weight: u32,
        index: usize,
        limits: UpstreamLimits,
        now: Instant,
    ) -> Self {
        Self {
            name: name.to_owned(),
            port,
            weight,
            index,
            limits,
            addrs: AddressSet::new(),
            health: HealthTracker::new(now),
            credit: 0,
        }
    }

    /// Host name or IP literal this upstream was configured with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Static load-balancing weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Position in the pool; lower means higher priority on ties.
    pub fn priority_index(&self) -> usize {
        self.index
    }

    /// Handle for looking this upstream up again later.
    pub fn id(&self) -> UpstreamId {
        UpstreamId(self.index)
    }

    /// Errors counted in the current error window.
    pub fn errors(&self) -> u32 {
        self.health.errors()
    }

    /// The resolved addresses of this upstream.
    pub fn addresses(&self) -> &AddressSet {
        &self.addrs
    }

    /// Appends a resolved address.
    pub fn add_address(&mut self, addr: SocketAddr) {
        self.addrs.add_address(addr);
    }

    /// Appends an IP address using this upstream's port.
    pub fn add_ip(&mut self, ip: IpAddr) {
        self.add_address(SocketAddr::new(ip, self.port));
    }

    /// Returns `true` if the upstream is alive, reviving it if its dead
    /// period is over.
    pub fn is_alive(&mut self) -> bool {
        self.is_alive_at(Instant::now())
    }

    /// [`is_alive`](Self::is_alive) against an explicit clock reading.
    pub fn is_alive_at(&mut self, now: Instant) -> bool {
        self.state_at(now) == HealthState::Alive
    }

    /// Health state at `now`, after the revival check.
    pub fn state_at(&mut self, now: Instant) -> HealthState {
        if self.health.refresh(now, &self.limits) {
            info!(upstream = %self.name, port = self.port, "upstream revived");
        }
        self.health.state(now, &self.limits)
    }

    /// Next address to connect to.
    pub fn address(&mut self) -> Result<SocketAddr> {
        self.address_at(Instant::now())
    }

    /// [`address`](Self::address) against an explicit clock reading.
    pub fn address_at(&mut self, now: Instant) -> Result<SocketAddr> {
        self.addrs
            .next_address(now)
            .map_err(|_| UpstreamError::NoAddresses(self.name.clone()))
    }

    /// Reports a failed exchange with this upstream.
    ///
    /// The family of `addr` is taken out of address rotation for the
    /// pool's address cooldown. Without an explicit address the one most
    /// recently handed out by [`address`](Self::address) is blamed.
    pub fn fail(&mut self, addr: Option<SocketAddr>) {
        self.fail_at(addr, Instant::now());
    }

    /// [`fail`](Self::fail) against an explicit clock reading.
    pub fn fail_at(&mut self, addr: Option<SocketAddr>, now: Instant) {
        if let Some(addr) = addr.or_else(|| self.addrs.last_returned()) {
            self.addrs
                .exclude_family(AddressFamily::of(&addr), now, self.limits.address_cooldown);
        }

        if self.health.record_failure(now, &self.limits) {
            warn!(
                upstream = %self.name,
                port = self.port,
                errors = self.health.errors(),
                "upstream marked dead"
            );
        } else {
            debug!(upstream = %self.name, errors = self.health.errors(), "upstream failure");
        }
    }

    /// Reports a successful exchange, clearing accumulated errors.
    pub fn ok(&mut self) {
        self.ok_at(Instant::now());
    }

    /// [`ok`](Self::ok) against an explicit clock reading.
    pub fn ok_at(&mut self, now: Instant) {
        self.health.record_success(now, &self.limits);
    }
}

/// Outcome of parsing a server line into a pool.
#[derive(Debug, Default)]
pub struct ParseReport {
    /// Upstreams added, in line order.
    pub added: Vec<UpstreamId>,
    /// Entries that were rejected, each as an [`UpstreamError::Parse`].
    pub rejected: Vec<UpstreamError>,
}

/// Point-in-time view of a pool, suitable for logging or export.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Number of upstreams.
    pub size: usize,
    /// Number of upstreams currently alive.
    pub alive: usize,
    /// Per-upstream details in pool order.
    pub upstreams: Vec<UpstreamStats>,
}

/// Point-in-time view of one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStats {
    /// Configured host.
    pub name: String,
    /// Configured port.
    pub port: u16,
    /// Static weight.
    pub weight: u32,
    /// Health state.
    pub state: HealthState,
    /// Errors in the current window.
    pub errors: u32,
    /// Resolved addresses.
    pub addresses: Vec<SocketAddr>,
}

/// Ordered pool of upstreams sharing one health policy.
#[derive(Debug, Clone, Default)]
pub struct UpstreamPool {
    upstreams: Vec<Upstream>,
    limits: UpstreamLimits,
}

impl UpstreamPool {
    /// Creates an empty pool.
    pub fn new(limits: UpstreamLimits) -> Self {
        Self {
            upstreams: Vec::new(),
            limits,
        }
    }

    /// Builds a pool from a server line.
    ///
    /// Individually malformed entries are logged and skipped; the call fails
    /// only if no entry is usable.
    pub fn from_line(line: &str, default_port: u16, limits: UpstreamLimits) -> Result<Self> {
        let mut pool = Self::new(limits);
        pool.parse_line(line, default_port)?;
        Ok(pool)
    }

    /// Appends every usable entry of a server line.
    ///
    /// Returns [`UpstreamError::EmptyPool`] when the line yields nothing.
    pub fn parse_line(&mut self, line: &str, default_port: u16) -> Result<ParseReport> {
        let mut report = ParseReport::default();

        for entry in split_server_line(line) {
            match self.add_server(entry, default_port) {
                Ok(id) => report.added.push(id),
                Err(e) => {
                    warn!(%entry, error = %e, "rejecting upstream entry");
                    report.rejected.push(e);
                }
            }
        }

        if report.added.is_empty() {
            return Err(UpstreamError::EmptyPool(line.to_owned()));
        }

        debug!(
            added = report.added.len(),
            rejected = report.rejected.len(),
            "parsed upstream line"
        );
        Ok(report)
    }

    /// Parses and appends a single `host[:port[:weight]]` entry.
    pub fn add_server(&mut self, entry: &str, default_port: u16) -> Result<UpstreamId> {
        let server = parse_server_entry(entry, default_port)?;
        Ok(self.push(&server.host, server.port, server.weight))
    }

    /// Appends an upstream. IP literal hosts get their address immediately;
    /// host names wait for the resolver.
    pub fn add_upstream(&mut self, host: &str, port: u16, weight: u32) -> Result<UpstreamId> {
        let entry = format!("{host}:{port}:{weight}");
        validate_host(&entry, host)?;
        if weight == 0 {
            return Err(UpstreamError::parse(&entry, "weight must be positive"));
        }
        Ok(self.push(host, port, weight))
    }

    fn push(&mut self, host: &str, port: u16, weight: u32) -> UpstreamId {
        let index = self.upstreams.len();
        let mut upstream = Upstream::new(host, port, weight, index, self.limits, Instant::now());
        if let Ok(ip) = host.parse::<IpAddr>() {
            upstream.add_ip(ip);
        }
        self.upstreams.push(upstream);
        UpstreamId(index)
    }

    /// Health policy of this pool.
    pub fn limits(&self) -> &UpstreamLimits {
        &self.limits
    }

    /// Number of upstreams, dead or alive.
    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    /// Returns `true` if the pool has no upstreams.
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Iterates over upstreams in pool order.
    pub fn iter(&self) -> impl Iterator<Item = &Upstream> {
        self.upstreams.iter()
    }

    /// Mutable iteration in pool order, used by resolvers.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Upstream> {
        self.upstreams.iter_mut()
    }

    /// Looks an upstream up by handle.
    pub fn get(&self, id: UpstreamId) -> Option<&Upstream> {
        self.upstreams.get(id.0)
    }

    /// Looks an upstream up by handle for reporting results.
    pub fn get_mut(&mut self, id: UpstreamId) -> Option<&mut Upstream> {
        self.upstreams.get_mut(id.0)
    }

    /// First upstream with the given name.
    pub fn find(&self, name: &str) -> Option<&Upstream> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    /// Number of upstreams currently alive. Revives upstreams whose dead
    /// period is over.
    pub fn alive_count(&mut self) -> usize {
        self.alive_count_at(Instant::now())
    }

    /// [`alive_count`](Self::alive_count) against an explicit clock reading.
    pub fn alive_count_at(&mut self, now: Instant) -> usize {
        let mut alive = 0;
        for upstream in &mut self.upstreams {
            if upstream.is_alive_at(now) {
                alive += 1;
            }
        }
        alive
    }

    /// Selects an upstream under `rotation`.
    ///
    /// Only alive upstreams are considered. When none is alive the whole
    /// pool is used instead, so a selection is always made unless the pool
    /// is empty.
    pub fn select(&mut self, rotation: Rotation, key: Option<&[u8]>) -> Result<&mut Upstream> {
        self.select_at(rotation, key, Instant::now())
    }

    /// [`select`](Self::select) against an explicit clock reading.
    pub fn select_at(
        &mut self,
        rotation: Rotation,
        key: Option<&[u8]>,
        now: Instant,
    ) -> Result<&mut Upstream> {
        if self.upstreams.is_empty() {
            return Err(UpstreamError::NoUpstream);
        }

        let mut candidates = self
            .upstreams
            .iter_mut()
            .filter_map(|u| u.is_alive_at(now).then_some(u.index))
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            debug!(size = self.upstreams.len(), "no alive upstreams, using whole pool");
            candidates = (0..self.upstreams.len()).collect();
        }

        let idx = balancer::select(rotation, &mut self.upstreams, &candidates, key)
            .ok_or(UpstreamError::NoUpstream)?;

        let upstream = &mut self.upstreams[idx];
        trace!(upstream = %upstream.name, %rotation, "selected upstream");
        Ok(upstream)
    }

    /// Snapshot of the pool's health and addresses.
    pub fn stats(&mut self) -> PoolStats {
        self.stats_at(Instant::now())
    }

    /// [`stats`](Self::stats) against an explicit clock reading.
    pub fn stats_at(&mut self, now: Instant) -> PoolStats {
        let upstreams = self
            .upstreams
            .iter_mut()
            .map(|u| UpstreamStats {
                state: u.state_at(now),
                name: u.name.clone(),
                port: u.port,
                weight: u.weight,
                errors: u.errors(),
                addresses: u.addrs.iter().copied().collect(),
            })
            .collect::<Vec<_>>();

        PoolStats {
            size: upstreams.len(),
            alive: upstreams
                .iter()
                .filter(|u| u.state == HealthState::Alive)
                .count(),
            upstreams,
        }
    }
}
