//! Configuration for a Verikad node
//!
//! All protocol constants and timers live here so embedders (and tests) can
//! tune them in one place. Defaults follow the classic Kademlia parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{DEFAULT_ALPHA, DEFAULT_K, PROTOCOL_VERSION};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bucket capacity and replication factor
    pub k: usize,
    /// Lookup parallelism
    pub alpha: usize,
    /// Protocol version advertised and required
    pub version: u16,
    /// Optional relaxed-split stride (`b` parameter); 1 disables it
    pub split_stride: usize,
    /// Failures before a contact is evicted from its bucket
    pub max_failures: u32,
    /// Largest accepted item value, in bytes
    pub max_value_bytes: usize,
    /// Accepted forward clock skew on item timestamps
    pub clock_skew: Duration,

    /// Per-request timeout
    pub request_timeout: Duration,
    /// Whole-lookup deadline
    pub lookup_deadline: Duration,
    /// Bucket-head liveness probe timeout
    pub probe_timeout: Duration,

    /// Bucket refresh interval
    pub refresh_interval: Duration,
    /// Datastore republication interval
    pub republish_interval: Duration,
    /// Datastore expiry scan interval
    pub expiry_scan_interval: Duration,
    /// Engine housekeeping tick (request reaper, lookup driver)
    pub tick_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            version: PROTOCOL_VERSION,
            split_stride: 1,
            max_failures: 3,
            max_value_bytes: 65536,
            clock_skew: Duration::from_secs(120),
            request_timeout: Duration::from_secs(1),
            lookup_deadline: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(500),
            refresh_interval: Duration::from_secs(3600),
            republish_interval: Duration::from_secs(3600),
            expiry_scan_interval: Duration::from_secs(60),
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Validate parameter sanity before a node is constructed.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::Config("k must be at least 1".into()));
        }
        if self.alpha == 0 || self.alpha > self.k {
            return Err(Error::Config("alpha must be in 1..=k".into()));
        }
        if self.split_stride == 0 {
            return Err(Error::Config("split_stride must be at least 1".into()));
        }
        if self.request_timeout > self.lookup_deadline {
            return Err(Error::Config(
                "request timeout exceeds lookup deadline".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be nonzero".into()));
        }
        Ok(())
    }
}
