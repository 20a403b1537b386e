//! Upstream selection and health tracking for pools of redundant backends.
//!
//! A pool is an ordered list of upstreams (DNS resolvers, HTTP redirectors,
//! scanning backends) with a shared health policy. Callers pick an upstream
//! under one of four rotations, take the next address from it, and report
//! the outcome back:
//!
//! ```
//! use upstream_pool::{Rotation, UpstreamLimits, UpstreamPool};
//!
//! let mut pool = UpstreamPool::from_line(
//!     "127.0.0.1:53:1, 127.0.0.2:53:2",
//!     53,
//!     UpstreamLimits::default(),
//! )?;
//!
//! let upstream = pool.select(Rotation::RoundRobin, None)?;
//! let addr = upstream.address()?;
//! // ... talk to `addr` ...
//! upstream.fail(Some(addr));
//!
//! assert_eq!(pool.len(), 2);
//! # Ok::<(), upstream_pool::UpstreamError>(())
//! ```
//!
//! Failing upstreams are quarantined after `max_errors` failures within
//! `error_time` and come back on their own after `revive_time`. When every
//! upstream is down, selection still returns one rather than failing.

pub mod address;
pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod resolve;
pub mod upstream;

pub use address::{AddressFamily, AddressSet};
pub use balancer::Rotation;
pub use config::{Config, PoolConfig, RuntimeConfig, ServerEntry, UpstreamConfig};
pub use error::UpstreamError;
pub use health::{HealthState, HealthTracker, UpstreamLimits};
pub use upstream::{ParseReport, PoolStats, Upstream, UpstreamId, UpstreamPool, UpstreamStats};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UpstreamError>;
