//! Populates upstream address sets from the system resolver.
//!
//! Resolution is a collaborator of the pool, not part of it: these helpers
//! only call [`Upstream::add_address`] with whatever the resolver returns.
//! A failed lookup leaves the upstream as it was and is reported back to the
//! caller, it never invalidates the rest of the pool.

use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::{Result, Upstream, UpstreamError, UpstreamPool};

/// Resolves one upstream's host and appends every new address.
///
/// Returns the number of addresses added. Addresses already present are
/// skipped, so repeated resolution is idempotent.
pub async fn resolve_upstream(upstream: &mut Upstream) -> Result<usize> {
    let host = upstream.name().to_owned();
    let resolved = lookup_host((host.as_str(), upstream.port()))
        .await
        .map_err(|e| UpstreamError::Resolve {
            host: host.clone(),
            reason: e.to_string(),
        })?;

    let mut added = 0;
    for addr in resolved {
        if !upstream.addresses().contains(&addr) {
            upstream.add_address(addr);
            added += 1;
        }
    }

    debug!(upstream = %host, added, total = upstream.addresses().len(), "resolved upstream");
    Ok(added)
}

/// Resolves every upstream of a pool in order.
///
/// Returns the failures; upstreams that resolved are updated in place.
pub async fn resolve_pool(pool: &mut UpstreamPool) -> Vec<UpstreamError> {
    let mut failures = Vec::new();

    for upstream in pool.iter_mut() {
        if let Err(e) = resolve_upstream(upstream).await {
            warn!(upstream = %upstream.name(), error = %e, "failed to resolve upstream");
            failures.push(e);
        }
    }

    failures
}
