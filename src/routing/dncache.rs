//! DN to target cache
//!
//! Remembers which target resolved an ambiguous DN so the unique-match probe
//! is not repeated for every request on the same entry.

use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::dn::Dn;
use crate::types::{MetaError, Result};

/// Lifetime of cached DN resolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    Disabled,
    Forever,
    Ttl(Duration),
}

impl FromStr for CacheTtl {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "0" => Ok(Self::Disabled),
            "forever" | "-1" => Ok(Self::Forever),
            n => n
                .parse::<u64>()
                .map(|secs| Self::Ttl(Duration::from_secs(secs)))
                .map_err(|_| MetaError::Config(format!("invalid dncache_ttl \"{}\"", s))),
        }
    }
}

/// Concurrent DN to target-index map with optional expiry
#[derive(Debug)]
pub struct DnCache {
    ttl: CacheTtl,
    entries: DashMap<Dn, (usize, Instant)>,
}

impl DnCache {
    pub fn new(ttl: CacheTtl) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> CacheTtl {
        self.ttl
    }

    /// Cached target for `dn`, dropping the entry if it has expired
    pub fn get(&self, dn: &Dn) -> Option<usize> {
        let limit = match self.ttl {
            CacheTtl::Disabled => return None,
            CacheTtl::Forever => None,
            CacheTtl::Ttl(d) => Some(d),
        };

        let (target, stored) = self.entries.get(dn).map(|e| *e.value())?;
        match limit {
            Some(d) if stored.elapsed() > d => {
                self.evict_expired(dn, d);
                None
            }
            _ => Some(target),
        }
    }

    /// Remove `dn` only if the entry stored now is older than `limit`; a
    /// resolution put since the caller's read survives.
    fn evict_expired(&self, dn: &Dn, limit: Duration) -> bool {
        self.entries
            .remove_if(dn, |_, (_, stored)| stored.elapsed() > limit)
            .is_some()
    }

    /// Remember that `dn` lives on `target`
    pub fn put(&self, dn: &Dn, target: usize) {
        if self.ttl != CacheTtl::Disabled {
            self.entries.insert(dn.clone(), (target, Instant::now()));
        }
    }

    /// Forget `dn`, e.g. after its target answered no-such-object
    pub fn forget(&self, dn: &Dn) -> Option<usize> {
        self.entries.remove(dn).map(|(_, (target, _))| target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
