//! Pool entries
//!
//! A pool entry groups one session per target under a single identity.
//! Reference counting and the tainted flag live under the entry lock; each
//! session has its own lock so targets never wait on each other.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use super::identity::IdentityKey;
use super::session::{SessionStatus, SingleTargetSession};
use crate::transport::DirectoryConnection;

/// Principal the whole entry was authorized as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthzTarget {
    #[default]
    None,
    /// Bound on every target (root bind)
    All,
    /// Bound on one specific target
    Target(usize),
}

#[derive(Debug)]
pub(crate) struct EntryState {
    pub(crate) refcount: usize,
    pub(crate) tainted: bool,
    /// Allocated for an explicit bind and not yet published to the index
    pub(crate) detached: bool,
    pub(crate) freed: bool,
    pub(crate) last_used: Instant,
    pub(crate) authz: AuthzTarget,
}

/// Group of per-target sessions sharing one identity
#[derive(Debug)]
pub struct PoolEntry {
    id: Uuid,
    key: IdentityKey,
    created_at: Instant,
    pub(crate) state: Mutex<EntryState>,
    sessions: Vec<Mutex<SingleTargetSession>>,
}

/// Point-in-time view of an entry for operator output
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: Uuid,
    pub refcount: usize,
    pub tainted: bool,
    pub authz: AuthzTarget,
    pub sessions: Vec<SessionStatus>,
}

impl PoolEntry {
    pub(crate) fn new(key: IdentityKey, targets: usize, detached: bool) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            key,
            created_at: now,
            state: Mutex::new(EntryState {
                refcount: 0,
                tainted: false,
                detached,
                freed: false,
                last_used: now,
                authz: AuthzTarget::None,
            }),
            sessions: (0..targets).map(|_| Mutex::new(SingleTargetSession::new())).collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    pub fn is_tainted(&self) -> bool {
        self.state.lock().tainted
    }

    pub fn is_freed(&self) -> bool {
        self.state.lock().freed
    }

    pub fn last_used(&self) -> Instant {
        self.state.lock().last_used
    }

    pub fn authz_target(&self) -> AuthzTarget {
        self.state.lock().authz
    }

    pub fn set_authz_target(&self, authz: AuthzTarget) {
        self.state.lock().authz = authz;
    }

    /// Number of per-target slots
    pub fn targets(&self) -> usize {
        self.sessions.len()
    }

    /// Lock the session for target `idx`
    pub fn session(&self, idx: usize) -> Option<MutexGuard<'_, SingleTargetSession>> {
        self.sessions.get(idx).map(|s| s.lock())
    }

    pub fn session_status(&self, idx: usize) -> Option<SessionStatus> {
        self.session(idx).map(|s| s.status())
    }

    /// Transport handle of a usable session
    pub fn connection(&self, idx: usize) -> Option<Arc<dyn DirectoryConnection>> {
        let session = self.session(idx)?;
        if session.is_usable() {
            session.connection()
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let (refcount, tainted, authz) = {
            let st = self.state.lock();
            (st.refcount, st.tainted, st.authz)
        };
        EntrySnapshot {
            id: self.id,
            refcount,
            tainted,
            authz,
            sessions: self.sessions.iter().map(|s| s.lock().status()).collect(),
        }
    }

    /// Take one reference
    pub(crate) fn retain(&self) {
        let mut st = self.state.lock();
        st.refcount += 1;
        st.last_used = Instant::now();
    }

    /// Taint every session and collect their connections for closing
    pub(crate) fn drain_sessions(&self) -> Vec<Arc<dyn DirectoryConnection>> {
        self.sessions.iter().filter_map(|s| s.lock().taint()).collect()
    }
}
