//! Error types for pool construction, selection, and resolution.

use std::fmt;

/// Every failure the upstream subsystem can report to its caller.
///
/// Connection-level problems (timeouts, refused connections) are not part
/// of this type. They are fed back through [`Upstream::fail`] and only ever
/// change health state.
///
/// [`Upstream::fail`]: crate::Upstream::fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// A single server entry could not be parsed. Other entries on the same
    /// line are unaffected.
    Parse {
        /// The offending entry as written.
        entry: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A server line produced no usable upstreams.
    EmptyPool(String),
    /// Selection was requested from a pool with no upstreams at all.
    NoUpstream,
    /// An address was requested from an upstream that has none yet.
    NoAddresses(String),
    /// The configuration file could not be loaded or failed validation.
    Config(String),
    /// Name resolution failed for one upstream.
    Resolve {
        /// The host name that was looked up.
        host: String,
        /// The resolver's error message.
        reason: String,
    },
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { entry, reason } => {
                write!(f, "invalid upstream entry \"{entry}\": {reason}")
            }
            Self::EmptyPool(line) => write!(f, "no usable upstreams in \"{line}\""),
            Self::NoUpstream => write!(f, "no upstreams configured"),
            Self::NoAddresses(name) => write!(f, "upstream {name} has no addresses"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Resolve { host, reason } => write!(f, "cannot resolve {host}: {reason}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl UpstreamError {
    pub(crate) fn parse(entry: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            entry: entry.to_owned(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that only affect a single entry and leave
    /// the rest of the pool usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Resolve { .. })
    }
}

impl From<serde_yaml::Error> for UpstreamError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(format!("failed to parse config: {err}"))
    }
}
