//! Canonical Kademlia constants, as fixed by the spec rather than left to
//! per-node configuration: the id width is a wire-format invariant, not a
//! tuning knob.

use std::time::Duration;

/// Width of an [`crate::Id`] in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Width of an [`crate::Id`] in bits.
pub const ID_LEN_BITS: usize = ID_LEN * 8;

/// Canonical bucket size (`K` in the original paper).
pub const DEFAULT_BUCKET_SIZE: usize = 8;

/// Canonical replacement-cache size per bucket.
pub const DEFAULT_BUCKET_REPLACEMENT_SIZE: usize = 8;

/// Canonical lookup parallelism (`alpha` in the original paper).
pub const DEFAULT_ALPHA: usize = 3;

/// A bucket head older than this is considered stale enough to probe before
/// evicting it in favour of a new arrival.
pub const DEFAULT_MAX_PING_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// A bucket untouched for longer than this is refreshed by maintenance.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Per-RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall deadline for one iterative lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
