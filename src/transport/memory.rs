//! In-process directory servers
//!
//! `MemoryConnector` hands out connections to `MemoryDirectory` instances
//! keyed by URI. Each directory holds a set of entry DNs and simple-bind
//! users, can be switched down, and counts connects and binds so the engine
//! can be exercised end to end without a network.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ConnectParams, Connector, DirectoryConnection};
use crate::dn::Dn;
use crate::types::{MetaError, Result};

/// One simulated directory server
#[derive(Default)]
pub struct MemoryDirectory {
    entries: Mutex<HashSet<Dn>>,
    users: Mutex<HashMap<Dn, String>>,
    down: AtomicBool,
    delay: Mutex<Duration>,
    connects: AtomicUsize,
    binds: AtomicUsize,
    probes: AtomicUsize,
    closes: AtomicUsize,
}

impl MemoryDirectory {
    /// Add an entry; malformed DNs are ignored
    pub fn add_entry(&self, dn: &str) {
        if let Ok(dn) = Dn::parse(dn) {
            self.entries.lock().insert(dn);
        }
    }

    /// Add a simple-bind user (also added as an entry)
    pub fn add_user(&self, dn: &str, password: &str) {
        if let Ok(parsed) = Dn::parse(dn) {
            self.entries.lock().insert(parsed.clone());
            self.users.lock().insert(parsed, password.to_string());
        }
    }

    /// Refuse every connection and operation while down
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Delay applied to connects and binds
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_up(&self, uri: &str) -> Result<()> {
        if self.is_down() {
            Err(MetaError::ServerDown(uri.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Connector over a set of in-process directories
#[derive(Default)]
pub struct MemoryConnector {
    servers: DashMap<String, Arc<MemoryDirectory>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory serving `uri`, created on first use
    pub fn server(&self, uri: &str) -> Arc<MemoryDirectory> {
        self.servers
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(MemoryDirectory::default()))
            .value()
            .clone()
    }

    /// Total connects across every directory
    pub fn total_connects(&self) -> usize {
        self.servers.iter().map(|s| s.connects()).sum()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn DirectoryConnection>> {
        let dir = self
            .servers
            .get(&params.uri)
            .map(|s| s.value().clone())
            .ok_or_else(|| MetaError::ServerDown(format!("{}: no such server", params.uri)))?;

        dir.connects.fetch_add(1, Ordering::SeqCst);
        dir.pause().await;
        dir.check_up(&params.uri)?;

        Ok(Arc::new(MemoryConnection {
            uri: params.uri.clone(),
            dir,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to a `MemoryDirectory`
pub struct MemoryConnection {
    uri: String,
    dir: Arc<MemoryDirectory>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MetaError::ServerDown(format!("{}: connection closed", self.uri)));
        }
        self.dir.check_up(&self.uri)
    }
}

#[async_trait]
impl DirectoryConnection for MemoryConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn simple_bind(&self, dn: &str, password: &str) -> Result<()> {
        self.dir.binds.fetch_add(1, Ordering::SeqCst);
        self.dir.pause().await;
        self.check_open()?;

        let dn = Dn::parse(dn)?;
        if dn.is_root() {
            return Ok(());
        }
        match self.dir.users.lock().get(&dn) {
            Some(stored) if stored == password => Ok(()),
            _ => Err(MetaError::InvalidCredentials),
        }
    }

    async fn probe_base(&self, dn: &str) -> Result<bool> {
        self.dir.probes.fetch_add(1, Ordering::SeqCst);
        self.check_open()?;
        let dn = Dn::parse(dn)?;
        Ok(self.dir.entries.lock().contains(&dn))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.dir.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
