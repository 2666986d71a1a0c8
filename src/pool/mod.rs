//! Pooled multi-target sessions
//!
//! - `identity`: how requests map onto pool entries
//! - `session`: one session to one target and its state machine
//! - `entry`: a group of sessions under one identity
//! - `pool`: the keyed, reference-counted collection of entries
//! - `sweeper`: optional background reclamation of expired entries

pub mod entry;
pub mod identity;
#[allow(clippy::module_inception)]
pub mod pool;
pub mod session;
pub mod sweeper;

use std::time::Duration;

use crate::config::PoolConfig;

pub use entry::{AuthzTarget, EntrySnapshot, PoolEntry};
pub use identity::{IdentityKey, Requester, SharingScope};
pub use pool::{ConnectionPool, EntryLease, PoolStatsSnapshot};
pub use session::{
    BindOutcome, Credentials, OutcomeReceiver, SessionState, SessionStatus, SingleTargetSession,
};
pub use sweeper::PoolSweeper;

/// Pool-wide expiry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSettings {
    /// Maximum lifetime of an entry
    pub conn_ttl: Option<Duration>,
    /// Maximum idle time of an unreferenced entry
    pub idle_timeout: Option<Duration>,
    /// Background sweep interval; `None` disables the sweeper
    pub sweep_interval: Option<Duration>,
}

impl PoolSettings {
    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self {
            conn_ttl: cfg.conn_ttl_secs.map(Duration::from_secs),
            idle_timeout: cfg.idle_timeout_secs.map(Duration::from_secs),
            sweep_interval: (cfg.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(cfg.sweep_interval_secs)),
        }
    }
}
