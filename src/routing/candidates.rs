//! Candidate selection
//!
//! Decides, per request, which targets must or may serve it. Write-style
//! operations need exactly one owner of the DN; when suffixes overlap the
//! owners are asked with a base-scope presence probe, falling back to the
//! configured default target. Searches go to every plausible target, and a
//! root bind goes to all of them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use super::dncache::DnCache;
use crate::config::OnError;
use crate::dn::{Dn, Scope};
use crate::target::{QuarantineController, TargetRegistry};
use crate::types::{MetaError, Result};

/// How many targets a request may involve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoutingMode {
    /// Exactly one target must own the DN
    RequireSingle,
    /// Every plausible target takes part
    AllowMultiple,
    /// Every configured target takes part
    RequireAll,
}

/// Operation being routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Delete,
    Modify,
    Compare,
    Rename,
    Search { scope: Scope },
    Bind { as_root: bool },
}

impl OperationKind {
    pub fn routing_mode(&self) -> RoutingMode {
        match self {
            Self::Search { .. } => RoutingMode::AllowMultiple,
            Self::Bind { as_root: true } => RoutingMode::RequireAll,
            _ => RoutingMode::RequireSingle,
        }
    }
}

/// Routing input for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRequest {
    pub kind: OperationKind,
    /// Target DN of the operation (the new entry's DN for add)
    pub dn: Dn,
    /// New superior of a rename
    pub new_parent: Option<Dn>,
}

impl RoutingRequest {
    pub fn new(kind: OperationKind, dn: Dn) -> Self {
        Self {
            kind,
            dn,
            new_parent: None,
        }
    }

    pub fn with_new_parent(mut self, parent: Dn) -> Self {
        self.new_parent = Some(parent);
        self
    }
}

/// Whether a target takes part in a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateTag {
    NotCandidate,
    Candidate,
}

/// Per-target routing result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSlot {
    pub tag: CandidateTag,
    /// Last error observed for this target during the request
    pub error: Option<MetaError>,
}

/// Candidate targets of one request, one slot per configured target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSet {
    mode: RoutingMode,
    slots: Vec<CandidateSlot>,
}

impl CandidateSet {
    pub fn new(mode: RoutingMode, targets: usize) -> Self {
        Self {
            mode,
            slots: vec![
                CandidateSlot {
                    tag: CandidateTag::NotCandidate,
                    error: None,
                };
                targets
            ],
        }
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> Option<&CandidateSlot> {
        self.slots.get(idx)
    }

    pub fn mark(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.tag = CandidateTag::Candidate;
        }
    }

    pub fn clear(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.tag = CandidateTag::NotCandidate;
        }
    }

    pub fn record_error(&mut self, idx: usize, err: MetaError) {
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.error = Some(err);
        }
    }

    pub fn is_candidate(&self, idx: usize) -> bool {
        matches!(self.slots.get(idx), Some(s) if s.tag == CandidateTag::Candidate)
    }

    /// Candidate indices in target order
    pub fn candidates(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.tag == CandidateTag::Candidate)
            .map(|(i, _)| i)
            .collect()
    }

    /// Candidates with no recorded error
    pub fn usable(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.tag == CandidateTag::Candidate && s.error.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.tag == CandidateTag::Candidate).count()
    }

    /// The only candidate, if there is exactly one
    pub fn single(&self) -> Option<usize> {
        match self.candidates().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Recorded errors by target
    pub fn errors(&self) -> impl Iterator<Item = (usize, &MetaError)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.error.as_ref().map(|e| (i, e)))
    }
}

/// Presence probe used to disambiguate overlapping suffixes
#[async_trait]
pub trait UniqueProbe: Send + Sync {
    /// Whether `dn` exists on `target`
    async fn probe(&self, target: usize, dn: &Dn) -> Result<bool>;
}

/// Computes candidate sets against the registry
pub struct CandidateSelector {
    registry: Arc<TargetRegistry>,
    quarantine: Arc<QuarantineController>,
    cache: DnCache,
}

impl CandidateSelector {
    pub fn new(registry: Arc<TargetRegistry>, quarantine: Arc<QuarantineController>) -> Self {
        let cache = DnCache::new(registry.dncache_ttl);
        Self {
            registry,
            quarantine,
            cache,
        }
    }

    pub fn cache(&self) -> &DnCache {
        &self.cache
    }

    /// Compute the candidate set of a request
    pub async fn select(&self, req: &RoutingRequest, probe: &dyn UniqueProbe) -> Result<CandidateSet> {
        let mode = req.kind.routing_mode();
        let mut set = CandidateSet::new(mode, self.registry.len());

        match mode {
            RoutingMode::RequireAll => {
                for t in self.registry.iter() {
                    if self.quarantine.is_blocked(t.index) {
                        set.record_error(t.index, MetaError::Quarantined(t.index));
                    } else {
                        set.mark(t.index);
                    }
                }
                if set.count() == 0 {
                    return Err(MetaError::NoCandidate(req.dn.to_string()));
                }
            }

            RoutingMode::AllowMultiple => {
                let scope = match req.kind {
                    OperationKind::Search { scope } => scope,
                    _ => Scope::Sub,
                };
                for t in self.registry.iter() {
                    if t.is_candidate(&req.dn, scope) {
                        set.mark(t.index);
                    }
                }
                if set.count() == 0 {
                    return Err(MetaError::NoCandidate(req.dn.to_string()));
                }
                for idx in set.candidates() {
                    if self.quarantine.is_blocked(idx) {
                        if self.registry.on_error == OnError::Stop {
                            return Err(MetaError::Quarantined(idx));
                        }
                        set.record_error(idx, MetaError::Quarantined(idx));
                    }
                }
            }

            RoutingMode::RequireSingle => {
                let idx = if req.kind == OperationKind::Add {
                    match self.select_unique(&req.dn.parent(), probe).await {
                        Err(MetaError::NoCandidate(_)) => self.select_unique(&req.dn, probe).await?,
                        other => other?,
                    }
                } else {
                    self.select_unique(&req.dn, probe).await?
                };

                if let (OperationKind::Rename, Some(parent)) = (req.kind, &req.new_parent) {
                    let dest = self.select_unique(parent, probe).await?;
                    if dest != idx {
                        debug!(from = idx, to = dest, "Rename crosses targets");
                        return Err(MetaError::CrossTargetUnsupported);
                    }
                }

                if self.quarantine.is_blocked(idx) {
                    if self.registry.on_error != OnError::Continue {
                        return Err(MetaError::Quarantined(idx));
                    }
                    set.record_error(idx, MetaError::Quarantined(idx));
                }
                set.mark(idx);
            }
        }

        debug!(dn = %req.dn, mode = ?mode, candidates = ?set.candidates(), "Selected candidates");
        Ok(set)
    }

    /// Resolve the single target owning `dn`
    pub async fn select_unique(&self, dn: &Dn, probe: &dyn UniqueProbe) -> Result<usize> {
        let matches: Vec<usize> = self
            .registry
            .iter()
            .filter(|t| t.is_candidate(dn, Scope::Base))
            .map(|t| t.index)
            .collect();

        match matches.as_slice() {
            [] => return Err(MetaError::NoCandidate(dn.to_string())),
            [only] => return Ok(*only),
            _ => {}
        }

        if let Some(cached) = self.cache.get(dn) {
            if matches.contains(&cached) {
                return Ok(cached);
            }
        }

        let results = join_all(matches.iter().map(|&idx| async move { (idx, probe.probe(idx, dn).await) })).await;

        let mut hits = Vec::new();
        for (idx, result) in results {
            match result {
                Ok(true) => hits.push(idx),
                Ok(false) => {}
                Err(e) => debug!(target_idx = idx, dn = %dn, "Unique-match probe failed: {}", e),
            }
        }

        if let [hit] = hits.as_slice() {
            self.cache.put(dn, *hit);
            return Ok(*hit);
        }

        if let Some(default) = self.registry.default_target {
            if matches.contains(&default) {
                debug!(dn = %dn, target_idx = default, "Falling back to default target");
                return Ok(default);
            }
        }

        warn!(dn = %dn, owners = ?matches, hits = hits.len(), "Unable to select unique candidate target");
        Err(MetaError::AmbiguousCandidate(dn.to_string()))
    }
}
