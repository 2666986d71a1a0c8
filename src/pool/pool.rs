//! Connection pool
//!
//! Entries are indexed by [`IdentityKey`] in an ordered map behind a single
//! pool lock, held only for the index operation itself. Callers hold an
//! [`EntryLease`]; dropping or releasing it gives the reference back, and
//! the pool frees an entry in exactly one place: when it is tainted (or was
//! never published) and its last reference goes away.
//!
//! Lock order is pool index, then entry, then quarantine.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::entry::PoolEntry;
use super::identity::IdentityKey;
use super::PoolSettings;
use crate::transport::DirectoryConnection;

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    created: AtomicU64,
    reused: AtomicU64,
    collisions: AtomicU64,
    expired: AtomicU64,
    freed: AtomicU64,
}

/// Snapshot of [`PoolStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub created: u64,
    pub reused: u64,
    pub collisions: u64,
    pub expired: u64,
    pub freed: u64,
    pub live: usize,
}

/// Keyed collection of pool entries
#[derive(Debug)]
pub struct ConnectionPool {
    index: Mutex<BTreeMap<IdentityKey, Arc<PoolEntry>>>,
    targets: usize,
    settings: PoolSettings,
    stats: PoolStats,
}

impl ConnectionPool {
    /// Create a pool whose entries hold `targets` sessions each
    pub fn new(targets: usize, settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            index: Mutex::new(BTreeMap::new()),
            targets,
            settings,
            stats: PoolStats::default(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Acquire an entry for `key`.
    ///
    /// Shared lookups reuse the indexed entry or insert a new one. An
    /// exclusive acquire (explicit bind) always allocates a fresh entry that
    /// stays out of the index until [`publish`](Self::publish) is called.
    pub fn acquire(self: &Arc<Self>, key: IdentityKey, exclusive: bool) -> EntryLease {
        if exclusive {
            let entry = Arc::new(PoolEntry::new(key, self.targets, true));
            entry.retain();
            self.stats.created.fetch_add(1, Ordering::Relaxed);
            debug!(entry = %entry.id(), key = ?entry.key(), "Allocated exclusive pool entry");
            return self.lease(entry);
        }

        let now = Instant::now();
        let mut expired = None;
        let lease = {
            let mut index = self.index.lock();
            let existing = index.get(&key).cloned();
            match existing {
                Some(entry) if !self.is_expired(&entry, now) => {
                    entry.retain();
                    self.stats.reused.fetch_add(1, Ordering::Relaxed);
                    self.lease(entry)
                }
                stale => {
                    if let Some(old) = stale {
                        index.remove(&key);
                        expired = Some(old);
                    }
                    let entry = Arc::new(PoolEntry::new(key.clone(), self.targets, false));
                    entry.retain();
                    index.insert(key, Arc::clone(&entry));
                    self.stats.created.fetch_add(1, Ordering::Relaxed);
                    debug!(entry = %entry.id(), key = ?entry.key(), "Inserted pool entry");
                    self.lease(entry)
                }
            }
        };

        if let Some(old) = expired {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            info!(entry = %old.id(), "Pool entry expired");
            self.taint_unindexed(&old);
        }

        lease
    }

    /// Make an exclusively acquired entry visible to later lookups.
    ///
    /// If another binder published an entry for the same key after ours was
    /// allocated, ours is discarded and the caller is moved onto theirs.
    /// Otherwise an older entry for the key is tainted and replaced.
    pub fn publish(self: &Arc<Self>, lease: EntryLease) -> EntryLease {
        let ours = Arc::clone(lease.entry());
        let mut replaced = None;

        let outcome = {
            let mut index = self.index.lock();
            let existing = index.get(ours.key()).cloned();
            match existing {
                Some(e) if Arc::ptr_eq(&e, &ours) => None,
                Some(theirs) if theirs.created_at() > ours.created_at() && !theirs.is_tainted() => {
                    theirs.retain();
                    Some(theirs)
                }
                other => {
                    replaced = other;
                    ours.state.lock().detached = false;
                    index.insert(ours.key().clone(), Arc::clone(&ours));
                    None
                }
            }
        };

        if let Some(old) = replaced {
            debug!(entry = %old.id(), "Replacing pool entry after bind");
            self.taint_unindexed(&old);
        }

        match outcome {
            Some(theirs) => {
                self.stats.collisions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    discarded = %ours.id(),
                    kept = %theirs.id(),
                    "Pool entry collision, sharing the newer entry"
                );
                drop(lease);
                self.lease(theirs)
            }
            None => lease,
        }
    }

    /// Give back one reference; frees the entry when it was the last one and
    /// the entry is tainted or was never published.
    pub fn release(&self, entry: &Arc<PoolEntry>) {
        let free = {
            let mut st = entry.state.lock();
            if st.refcount == 0 {
                error!(entry = %entry.id(), "Pool entry released more times than acquired");
                return;
            }
            st.refcount -= 1;
            st.last_used = Instant::now();
            let free = st.refcount == 0 && (st.tainted || st.detached) && !st.freed;
            if free {
                st.freed = true;
            }
            free
        };

        if free {
            self.free(entry);
        }
    }

    /// Remove an entry from the index and taint it
    pub fn taint(&self, entry: &Arc<PoolEntry>) {
        {
            let mut index = self.index.lock();
            if matches!(index.get(entry.key()), Some(e) if Arc::ptr_eq(e, entry)) {
                index.remove(entry.key());
            }
        }
        self.taint_unindexed(entry);
    }

    /// Reclaim every expired entry; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<PoolEntry>> = {
            let mut index = self.index.lock();
            let keys: Vec<IdentityKey> = index
                .iter()
                .filter(|(_, e)| self.is_expired(e, now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| index.remove(k)).collect()
        };

        for entry in &expired {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            self.taint_unindexed(entry);
        }
        if !expired.is_empty() {
            info!("Pool sweep reclaimed {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Indexed entry for `key`, if any
    pub fn lookup(&self, key: &IdentityKey) -> Option<Arc<PoolEntry>> {
        self.index.lock().get(key).cloned()
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            created: self.stats.created.load(Ordering::Relaxed),
            reused: self.stats.reused.load(Ordering::Relaxed),
            collisions: self.stats.collisions.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            freed: self.stats.freed.load(Ordering::Relaxed),
            live: self.len(),
        }
    }

    fn lease(self: &Arc<Self>, entry: Arc<PoolEntry>) -> EntryLease {
        EntryLease {
            pool: Arc::clone(self),
            entry,
            released: false,
        }
    }

    fn is_expired(&self, entry: &PoolEntry, now: Instant) -> bool {
        let st = entry.state.lock();
        if st.tainted {
            return true;
        }
        let aged_out = self
            .settings
            .conn_ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.created_at()) > ttl);
        let idle_out = st.refcount == 0
            && self
                .settings
                .idle_timeout
                .is_some_and(|idle| now.saturating_duration_since(st.last_used) > idle);
        aged_out || idle_out
    }

    /// Taint an entry that is no longer indexed; frees it if unreferenced
    fn taint_unindexed(&self, entry: &Arc<PoolEntry>) {
        let free = {
            let mut st = entry.state.lock();
            st.tainted = true;
            let free = st.refcount == 0 && !st.freed;
            if free {
                st.freed = true;
            }
            free
        };
        if free {
            self.free(entry);
        }
    }

    fn free(&self, entry: &Arc<PoolEntry>) {
        let conns = entry.drain_sessions();
        self.stats.freed.fetch_add(1, Ordering::Relaxed);
        debug!(entry = %entry.id(), sessions = conns.len(), "Freed pool entry");
        close_all(conns);
    }
}

/// Close connections in the background when a runtime is available
pub(crate) fn close_all(conns: Vec<Arc<dyn DirectoryConnection>>) {
    if conns.is_empty() {
        return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            for conn in conns {
                conn.close().await;
            }
        });
    }
}

/// A counted reference to a pool entry
#[derive(Debug)]
pub struct EntryLease {
    pool: Arc<ConnectionPool>,
    entry: Arc<PoolEntry>,
    released: bool,
}

impl EntryLease {
    pub fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }

    /// Take an additional reference on the same entry
    pub fn share(&self) -> EntryLease {
        self.entry.retain();
        self.pool.lease(Arc::clone(&self.entry))
    }

    /// Give the reference back now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.entry);
        }
    }
}

impl Deref for EntryLease {
    type Target = PoolEntry;

    fn deref(&self) -> &PoolEntry {
        &self.entry
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use std::time::Duration;

    fn pool(settings: PoolSettings) -> Arc<ConnectionPool> {
        ConnectionPool::new(2, settings)
    }

    #[test]
    fn test_shared_acquire_reuses_entry() {
        let pool = pool(PoolSettings::default());
        let a = pool.acquire(IdentityKey::anonymous(), false);
        let b = pool.acquire(IdentityKey::anonymous(), false);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.refcount(), 2);
        assert_eq!(a.targets(), 2);

        drop(b);
        a.release();
        let entry = pool.lookup(&IdentityKey::anonymous()).unwrap();
        assert_eq!(entry.refcount(), 0);
        assert!(!entry.is_freed());
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_tainted_entry_freed_only_after_last_release() {
        let pool = pool(PoolSettings::default());
        let a = pool.acquire(IdentityKey::privileged(), false);
        let b = a.share();
        let entry = Arc::clone(a.entry());

        pool.taint(&entry);
        assert!(pool.lookup(&IdentityKey::privileged()).is_none());
        assert!(!entry.is_freed());

        a.release();
        assert!(!entry.is_freed());
        drop(b);
        assert!(entry.is_freed());
        assert_eq!(pool.stats().freed, 1);

        // next lookup gets a fresh entry
        let c = pool.acquire(IdentityKey::privileged(), false);
        assert_ne!(c.id(), entry.id());
    }

    #[test]
    fn test_refcount_never_underflows() {
        let pool = pool(PoolSettings::default());
        let lease = pool.acquire(IdentityKey::anonymous(), false);
        let entry = Arc::clone(lease.entry());
        lease.release();
        pool.release(&entry);
        assert_eq!(entry.refcount(), 0);
    }

    #[test]
    fn test_unpublished_exclusive_entry_freed_on_release() {
        let pool = pool(PoolSettings::default());
        let key = IdentityKey::exclusive(1, Dn::parse("uid=u1,dc=x").unwrap());
        let lease = pool.acquire(key.clone(), true);
        let entry = Arc::clone(lease.entry());
        assert!(pool.lookup(&key).is_none());
        drop(lease);
        assert!(entry.is_freed());
    }

    #[test]
    fn test_publish_replaces_older_entry() {
        let pool = pool(PoolSettings::default());
        let key = IdentityKey::exclusive(1, Dn::parse("uid=u1,dc=x").unwrap());

        let old = pool.acquire(key.clone(), false);
        let old_entry = Arc::clone(old.entry());
        drop(old);

        let fresh = pool.publish(pool.acquire(key.clone(), true));
        assert!(old_entry.is_tainted());
        assert!(old_entry.is_freed());
        assert_eq!(pool.lookup(&key).unwrap().id(), fresh.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_collision_moves_loser_onto_winner() {
        let pool = pool(PoolSettings::default());
        let key = IdentityKey::exclusive(4, Dn::parse("uid=u4,dc=x").unwrap());

        let slow = pool.acquire(key.clone(), true);
        tokio::time::advance(Duration::from_millis(5)).await;
        let fast = pool.publish(pool.acquire(key.clone(), true));

        let slow_entry = Arc::clone(slow.entry());
        let shared = pool.publish(slow);
        assert_eq!(shared.id(), fast.id());
        assert_eq!(fast.refcount(), 2);
        assert!(slow_entry.is_freed());
        assert_eq!(pool.stats().collisions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_idle_expiry() {
        let pool = pool(PoolSettings {
            idle_timeout: Some(Duration::from_secs(30)),
            ..PoolSettings::default()
        });
        let first = pool.acquire(IdentityKey::anonymous(), false);
        let first_entry = Arc::clone(first.entry());
        drop(first);

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = pool.acquire(IdentityKey::anonymous(), false);
        assert_ne!(second.id(), first_entry.id());
        assert!(first_entry.is_tainted());
        assert!(first_entry.is_freed());
        assert_eq!(pool.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_referenced_entry_is_not_idle() {
        let pool = pool(PoolSettings {
            idle_timeout: Some(Duration::from_secs(30)),
            ..PoolSettings::default()
        });
        let held = pool.acquire(IdentityKey::anonymous(), false);
        tokio::time::advance(Duration::from_secs(120)).await;
        let again = pool.acquire(IdentityKey::anonymous(), false);
        assert_eq!(held.id(), again.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_keeps_holders_working() {
        let pool = pool(PoolSettings {
            conn_ttl: Some(Duration::from_secs(60)),
            ..PoolSettings::default()
        });
        let held = pool.acquire(IdentityKey::privileged(), false);
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(pool.sweep(), 1);
        assert!(held.is_tainted());
        assert!(!held.is_freed());
        let held_entry = Arc::clone(held.entry());
        drop(held);
        assert!(held_entry.is_freed());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_release_balances() {
        let pool = pool(PoolSettings::default());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire(IdentityKey::anonymous(), false);
                if i == 16 {
                    pool.taint(lease.entry());
                }
                tokio::task::yield_now().await;
                let entry = Arc::clone(lease.entry());
                lease.release();
                entry
            }));
        }

        let mut entries = Vec::new();
        for t in tasks {
            entries.push(t.await.unwrap());
        }
        for e in &entries {
            assert_eq!(e.refcount(), 0);
            assert_eq!(e.is_freed(), e.is_tainted());
        }
    }
}
