//! Shared test infrastructure for integration tests.
//!
//! Provides tracing setup, the pool limits used across tests, and a few
//! pool builders.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use upstream_pool::{UpstreamLimits, UpstreamPool};

/// The three-upstream line used throughout the selection tests.
pub const TEST_UPSTREAM_LIST: &str = "microsoft.com:443:1,google.com:80:2,kernel.org:443:3";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// One error kills an upstream, errors accumulate for two seconds and dead
/// upstreams come back after half a second.
pub fn test_limits() -> UpstreamLimits {
    UpstreamLimits {
        max_errors: 1,
        error_time: Duration::from_secs(2),
        revive_time: Duration::from_millis(500),
        address_cooldown: Duration::from_millis(500),
    }
}

/// Builds a pool from a server line with [`test_limits`].
pub fn test_pool(line: &str) -> UpstreamPool {
    UpstreamPool::from_line(line, 443, test_limits()).expect("test pool must parse")
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("test address must parse")
}
