//! The engine facade used by operation handlers
//!
//! `MetaBackend` wires the registry, quarantine controller, candidate
//! selector, pool and bind coordinator together. A handler typically calls
//! [`MetaBackend::prepare`], runs its remote operation on each candidate
//! through [`MetaBackend::with_session`], and merges the outcomes with
//! [`merge_outcomes`](crate::result::merge_outcomes).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::bind::BindCoordinator;
use crate::config::OnError;
use crate::dn::Dn;
use crate::pool::{
    AuthzTarget, ConnectionPool, Credentials, EntryLease, IdentityKey, PoolSweeper, Requester,
};
use crate::result::worst_error;
use crate::rewrite::{DnRewriter, RewriteContext, SuffixMassage};
use crate::routing::{CandidateSelector, CandidateSet, OperationKind, RoutingMode, RoutingRequest, UniqueProbe};
use crate::target::{QuarantineController, RecoveryHook, TargetRegistry};
use crate::transport::{Connector, DirectoryConnection};
use crate::types::{MetaError, ResultCode, Result};

/// A request ready to be sent: its pool entry and bound candidates
#[derive(Debug)]
pub struct Prepared {
    pub lease: EntryLease,
    /// Candidates; those with an error recorded must be skipped
    pub candidates: CandidateSet,
}

impl Prepared {
    /// Candidates whose session is ready
    pub fn targets(&self) -> Vec<usize> {
        self.candidates.usable()
    }
}

/// Builder for [`MetaBackend`]
pub struct MetaBackendBuilder {
    registry: Arc<TargetRegistry>,
    connector: Arc<dyn Connector>,
    rewriter: Option<Arc<dyn DnRewriter>>,
    on_recover: Option<RecoveryHook>,
}

impl MetaBackendBuilder {
    /// Replace the suffix rewriting derived from the registry
    pub fn rewriter(mut self, rewriter: Arc<dyn DnRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Hook fired with the target index when a target leaves quarantine
    pub fn recovery_hook(mut self, hook: RecoveryHook) -> Self {
        self.on_recover = Some(hook);
        self
    }

    pub fn build(self) -> MetaBackend {
        let registry = self.registry;
        let rewriter = self
            .rewriter
            .unwrap_or_else(|| SuffixMassage::from_registry(&registry).into_shared());

        let mut quarantine = QuarantineController::new(registry.quarantine_policies());
        if let Some(hook) = self.on_recover {
            quarantine = quarantine.with_recovery_hook(hook);
        }
        let quarantine = Arc::new(quarantine);

        let selector = CandidateSelector::new(Arc::clone(&registry), Arc::clone(&quarantine));
        let pool = ConnectionPool::new(registry.len(), registry.pool);
        let binder = BindCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&quarantine),
            self.connector,
            Arc::clone(&rewriter),
        );

        info!(
            targets = registry.len(),
            on_error = ?registry.on_error,
            proxy_authz = ?registry.proxy_authz,
            "Meta backend ready"
        );

        MetaBackend {
            registry,
            quarantine,
            selector,
            pool,
            binder,
            rewriter,
        }
    }
}

/// Multi-target routing and pooling engine
pub struct MetaBackend {
    registry: Arc<TargetRegistry>,
    quarantine: Arc<QuarantineController>,
    selector: CandidateSelector,
    pool: Arc<ConnectionPool>,
    binder: BindCoordinator,
    rewriter: Arc<dyn DnRewriter>,
}

impl MetaBackend {
    pub fn builder(registry: Arc<TargetRegistry>, connector: Arc<dyn Connector>) -> MetaBackendBuilder {
        MetaBackendBuilder {
            registry,
            connector,
            rewriter: None,
            on_recover: None,
        }
    }

    pub fn new(registry: Arc<TargetRegistry>, connector: Arc<dyn Connector>) -> Self {
        Self::builder(registry, connector).build()
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn quarantine(&self) -> &Arc<QuarantineController> {
        &self.quarantine
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn rewriter(&self) -> &Arc<dyn DnRewriter> {
        &self.rewriter
    }

    /// Candidate targets for a request, probing targets when ownership is ambiguous
    pub async fn select_candidates(&self, req: &RoutingRequest) -> Result<CandidateSet> {
        self.selector.select(req, self).await
    }

    /// Pool entry a request from `requester` runs on
    pub fn acquire_pool(&self, requester: &Requester, is_bind: bool) -> EntryLease {
        let key = IdentityKey::for_request(requester, self.registry.proxy_authz, is_bind);
        self.pool.acquire(key, false)
    }

    pub fn release_pool(&self, lease: EntryLease) {
        lease.release();
    }

    /// Make the session of `lease` for `idx` usable
    pub async fn ensure_bound(&self, lease: &EntryLease, idx: usize) -> Result<()> {
        let privileged = lease.key().uses_proxy_identity();
        self.binder.ensure_bound(lease.entry(), idx, privileged).await
    }

    /// Feed the outcome of a remote operation on `idx` into its quarantine state
    pub fn quarantine_report<T>(&self, idx: usize, outcome: &Result<T>) {
        self.quarantine.report(idx, outcome);
    }

    /// Tear down the session of `lease` for `idx` after a transport failure
    pub fn invalidate(&self, lease: &EntryLease, idx: usize) {
        self.binder.reset_session(lease, idx);
    }

    /// Select candidates, acquire the pool entry and bind every candidate.
    ///
    /// Routing errors are returned directly. A single-target request fails
    /// with its target's error; a fan-out request records per-target errors
    /// in the candidate set and only fails when every candidate failed, or
    /// on the first failure when `on_error` is `stop`.
    pub async fn prepare(&self, requester: &Requester, req: &RoutingRequest) -> Result<Prepared> {
        let mut candidates = self.select_candidates(req).await?;
        let is_bind = matches!(req.kind, OperationKind::Bind { .. });
        let lease = self.acquire_pool(requester, is_bind);

        let pending = candidates.usable();
        let results = join_all(pending.iter().map(|&idx| {
            let lease = &lease;
            async move { (idx, self.ensure_bound(lease, idx).await) }
        }))
        .await;

        for (idx, result) in results {
            let Err(e) = result else { continue };
            if candidates.mode() == RoutingMode::RequireSingle || self.registry.on_error == OnError::Stop {
                return Err(e);
            }
            debug!(target_idx = idx, "Candidate dropped: {}", e);
            candidates.record_error(idx, e);
        }

        if candidates.usable().is_empty() {
            let worst = worst_error(candidates.errors().map(|(_, e)| e));
            return Err(worst.unwrap_or_else(|| MetaError::NoCandidate(req.dn.to_string())));
        }

        Ok(Prepared { lease, candidates })
    }

    /// Run `op` on the connection of `lease` for `idx`.
    ///
    /// An error that means the target could not be reached tears the session
    /// down and the operation is tried once more on a fresh one. When that
    /// failure put the target in quarantine the retry is refused, and the
    /// original error is returned rather than `Quarantined`.
    pub async fn with_session<T, F, Fut>(&self, lease: &EntryLease, idx: usize, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn DirectoryConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut first_failure: Option<MetaError> = None;
        loop {
            if let Err(e) = self.ensure_bound(lease, idx).await {
                return Err(match (e, first_failure) {
                    (MetaError::Quarantined(_), Some(original)) => original,
                    (e, _) => e,
                });
            }
            let conn = lease
                .connection(idx)
                .ok_or_else(|| MetaError::Internal(format!("session {} not usable after bind", idx)))?;

            let result = op(conn).await;
            self.quarantine.report(idx, &result);

            match result {
                Err(e) if e.counts_against_target() && first_failure.is_none() => {
                    warn!(target_idx = idx, entry = %lease.id(), "Operation failed, retrying on a new session: {}", e);
                    self.invalidate(lease, idx);
                    first_failure = Some(e);
                }
                other => return other,
            }
        }
    }

    /// Authenticate a client.
    ///
    /// The bind runs on a fresh exclusive pool entry that replaces any older
    /// one for the same connection and DN once it succeeds. With `as_root`
    /// the caller has already authenticated the proxy's root identity and
    /// every target is bound with its identity-assertion account.
    pub async fn bind(&self, requester: &Requester, dn: &Dn, password: &str, as_root: bool) -> Result<EntryLease> {
        let req = RoutingRequest::new(OperationKind::Bind { as_root }, dn.clone());
        let candidates = match self.select_candidates(&req).await {
            Ok(set) => set,
            Err(e @ (MetaError::NoCandidate(_) | MetaError::AmbiguousCandidate(_))) => {
                debug!(dn = %dn, "Bind DN has no target: {}", e);
                return Err(MetaError::InvalidCredentials);
            }
            Err(e) => return Err(e),
        };

        let key = IdentityKey::exclusive(requester.connection_id, dn.clone());
        let lease = self.pool.acquire(key, true);

        if as_root {
            let targets = candidates.usable();
            let results = join_all(
                targets
                    .iter()
                    .map(|&idx| self.binder.ensure_bound(lease.entry(), idx, true)),
            )
            .await;

            let errors: Vec<MetaError> = results.into_iter().filter_map(|r| r.err()).collect();
            let stop = self.registry.on_error == OnError::Stop && !errors.is_empty();
            if stop || errors.len() == targets.len() {
                return Err(worst_error(&errors).unwrap_or_else(|| MetaError::NoCandidate(dn.to_string())));
            }
            lease.set_authz_target(AuthzTarget::All);
        } else {
            let idx = candidates
                .single()
                .ok_or_else(|| MetaError::Internal("bind selected more than one target".into()))?;
            if let Some(err) = candidates.slot(idx).and_then(|s| s.error.clone()) {
                return Err(err);
            }
            self.binder
                .bind_as(lease.entry(), idx, Credentials::new(dn.clone(), password))
                .await?;
            lease.set_authz_target(AuthzTarget::Target(idx));
        }

        info!(dn = %dn, connection = requester.connection_id, root = as_root, "Client bound");
        Ok(self.pool.publish(lease))
    }

    /// Forget a cached DN resolution, e.g. after its target reported no such object
    pub fn forget(&self, dn: &Dn) {
        if let Some(idx) = self.selector.cache().forget(dn) {
            debug!(dn = %dn, target_idx = idx, "Dropped cached DN resolution");
        }
    }

    /// Forget the cached resolution of `dn` when `outcome` says it is gone
    pub fn note_outcome<T>(&self, dn: &Dn, outcome: &Result<T>) {
        if let Err(MetaError::Remote {
            code: ResultCode::NoSuchObject,
            ..
        }) = outcome
        {
            self.forget(dn);
        }
    }

    /// Background sweeper for the pool, when a sweep interval is configured
    pub fn sweeper(&self) -> Option<Arc<PoolSweeper>> {
        self.registry
            .pool
            .sweep_interval
            .map(|interval| Arc::new(PoolSweeper::new(Arc::clone(&self.pool), interval)))
    }
}

#[async_trait]
impl UniqueProbe for MetaBackend {
    async fn probe(&self, target: usize, dn: &Dn) -> Result<bool> {
        let remote = self.rewriter.rewrite(target, RewriteContext::RequestDn, dn)?;
        let lease = self.pool.acquire(IdentityKey::privileged(), false);
        self.with_session(&lease, target, |conn| {
            let remote = remote.clone();
            async move { conn.probe_base(remote.as_str()).await }
        })
        .await
    }
}
