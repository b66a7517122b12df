use std::time::Duration;

use crate::consts::{
    DEFAULT_ALPHA, DEFAULT_BUCKET_REPLACEMENT_SIZE, DEFAULT_BUCKET_SIZE, DEFAULT_LOOKUP_TIMEOUT,
    DEFAULT_MAX_PING_INTERVAL, DEFAULT_REFRESH_INTERVAL, DEFAULT_RPC_TIMEOUT,
};

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SystemConfig {
    pub routing: RoutingConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RoutingConfig {
    // Also called k in the original paper
    pub bucket_size: usize,

    // Size of the replacements cache (nodes known but not used
    // for routing unless an existing bucket entry goes stale)
    pub bucket_replacement_size: usize,

    // Lookup parallelism, also called alpha in the original paper
    pub alpha: usize,

    // A full bucket's head older than this is probed before a new
    // contact is allowed to replace it
    pub max_ping_interval: Duration,

    // A bucket untouched for longer than this is refreshed by maintenance
    pub refresh_interval: Duration,

    // Per-RPC timeout
    pub rpc_timeout: Duration,

    // Overall deadline for one iterative lookup
    pub lookup_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            bucket_replacement_size: DEFAULT_BUCKET_REPLACEMENT_SIZE,
            alpha: DEFAULT_ALPHA,
            max_ping_interval: DEFAULT_MAX_PING_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StorageConfig {
    // Maximum stored value size (in bytes)
    pub max_value_size: usize,

    // Maximum number of stored entries
    pub max_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_value_size: 128 * 1024, // 128 KiB
            max_entries: 1024,          // so 128Mib
        }
    }
}
