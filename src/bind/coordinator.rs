//! Bind coordination
//!
//! Every handshake or re-bind on a session runs in a spawned task that owns
//! a `watch` sender. The session state records the matching receiver, so a
//! caller arriving while the attempt is in flight clones it and waits for the
//! published outcome instead of starting its own. A caller that gives up
//! only drops its receiver; the attempt keeps running for the others.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::dn::Dn;
use crate::pool::pool::close_all;
use crate::pool::{Credentials, OutcomeReceiver, PoolEntry, SessionState, SessionStatus};
use crate::rewrite::{DnRewriter, RewriteContext};
use crate::target::{QuarantineController, Target, TargetRegistry};
use crate::transport::{ConnectParams, Connector, DirectoryConnection};
use crate::types::{ErrorClass, MetaError, Result};

/// Identity a handshake binds with
#[derive(Debug, Clone)]
enum BindIdentity {
    /// Credentials the client bound with, in the proxy namespace
    Client(Credentials),
    /// The target's identity-assertion account, already in the remote namespace
    Proxy(Credentials),
    Anonymous,
}

enum Step {
    Ready,
    Wait { rx: OutcomeReceiver, overlay: bool },
    Start {
        tx: watch::Sender<Option<Result<()>>>,
        rx: OutcomeReceiver,
        identity: BindIdentity,
    },
}

enum BindStep {
    Wait(OutcomeReceiver),
    Rebind {
        conn: Arc<dyn DirectoryConnection>,
        tx: watch::Sender<Option<Result<()>>>,
        rx: OutcomeReceiver,
    },
    Create,
}

/// Serializes session establishment per (pool entry, target)
#[derive(Clone)]
pub struct BindCoordinator {
    registry: Arc<TargetRegistry>,
    quarantine: Arc<QuarantineController>,
    connector: Arc<dyn Connector>,
    rewriter: Arc<dyn DnRewriter>,
}

impl BindCoordinator {
    pub fn new(
        registry: Arc<TargetRegistry>,
        quarantine: Arc<QuarantineController>,
        connector: Arc<dyn Connector>,
        rewriter: Arc<dyn DnRewriter>,
    ) -> Self {
        Self {
            registry,
            quarantine,
            connector,
            rewriter,
        }
    }

    fn target(&self, idx: usize) -> Result<Arc<Target>> {
        self.registry
            .get(idx)
            .cloned()
            .ok_or_else(|| MetaError::Internal(format!("no target with index {}", idx)))
    }

    /// Make the session for `idx` usable.
    ///
    /// Returns immediately when it already is. Otherwise either joins the
    /// attempt in flight or starts one, binding with the session's stored
    /// credentials, then the proxy identity when `privileged`, then
    /// anonymously.
    pub async fn ensure_bound(&self, entry: &Arc<PoolEntry>, idx: usize, privileged: bool) -> Result<()> {
        let target = self.target(idx)?;

        loop {
            if !self.quarantine.allow(idx) {
                debug!(target_idx = idx, "Target quarantined, not connecting");
                return Err(MetaError::Quarantined(idx));
            }
            if entry.is_freed() {
                return Err(MetaError::Internal(format!("pool entry {} already freed", entry.id())));
            }

            let mut stale = Vec::new();
            let step = {
                let mut session = entry
                    .session(idx)
                    .ok_or_else(|| MetaError::Internal(format!("no session slot {}", idx)))?;

                if session.is_usable()
                    && session.is_expired(Instant::now(), target.idle_timeout, target.conn_ttl)
                {
                    debug!(target_idx = idx, entry = %entry.id(), "Session expired, reconnecting");
                    stale.extend(session.reset());
                }

                if session.is_usable() {
                    session.touch();
                    Step::Ready
                } else if let Some(rx) = session.pending().filter(|_| !session.is_stalled()) {
                    Step::Wait {
                        rx,
                        overlay: session.status() == SessionStatus::Binding,
                    }
                } else {
                    if session.is_stalled() {
                        warn!(target_idx = idx, entry = %entry.id(), "Abandoned bind attempt, restarting");
                        stale.extend(session.reset());
                    }
                    let identity = match (&session.credentials, &target.idassert) {
                        (Some(creds), _) => BindIdentity::Client(creds.clone()),
                        (None, Some(ia)) if privileged => BindIdentity::Proxy(Credentials {
                            dn: ia.authc_dn.clone(),
                            password: ia.password.clone(),
                        }),
                        _ => BindIdentity::Anonymous,
                    };
                    let (tx, rx) = watch::channel(None);
                    session.transition(SessionState::Creating { done: rx.clone() });
                    Step::Start { tx, rx, identity }
                }
            };
            close_all(stale);

            // a success is only trusted once the session itself says usable
            match step {
                Step::Ready => return Ok(()),
                Step::Wait { rx, overlay } => match wait_outcome(rx).await {
                    // a rejected re-bind leaves the connection anonymous
                    Err(e) if e.is_transport() || !overlay => return Err(e),
                    _ => continue,
                },
                Step::Start { tx, rx, identity } => {
                    let coordinator = self.clone();
                    let entry = Arc::clone(entry);
                    let target = Arc::clone(&target);
                    let mine = rx.clone();
                    tokio::spawn(async move {
                        coordinator.handshake(entry, target, identity, tx, mine).await;
                    });
                    wait_outcome(rx).await?;
                }
            }
        }
    }

    /// Authenticate the session for `idx` as the client identified by `creds`.
    ///
    /// A usable session is re-bound in place through the `Binding` overlay;
    /// an absent one is created with the credentials stored on it. A rejected
    /// re-bind leaves the connection anonymous.
    pub async fn bind_as(&self, entry: &Arc<PoolEntry>, idx: usize, creds: Credentials) -> Result<()> {
        let target = self.target(idx)?;

        loop {
            if !self.quarantine.allow(idx) {
                return Err(MetaError::Quarantined(idx));
            }

            let step = {
                let mut session = entry
                    .session(idx)
                    .ok_or_else(|| MetaError::Internal(format!("no session slot {}", idx)))?;

                if let Some(rx) = session.pending().filter(|_| !session.is_stalled()) {
                    BindStep::Wait(rx)
                } else if let Some(conn) = session.connection().filter(|_| session.is_usable()) {
                    let (tx, rx) = watch::channel(None);
                    session.transition(SessionState::Binding {
                        conn: Arc::clone(&conn),
                        done: rx.clone(),
                    });
                    BindStep::Rebind { conn, tx, rx }
                } else {
                    session.credentials = Some(creds.clone());
                    BindStep::Create
                }
            };

            match step {
                BindStep::Wait(rx) => {
                    let _ = wait_outcome(rx).await;
                }
                BindStep::Create => return self.ensure_bound(entry, idx, false).await,
                BindStep::Rebind { conn, tx, rx } => {
                    let coordinator = self.clone();
                    let entry_ref = Arc::clone(entry);
                    let target = Arc::clone(&target);
                    let mine = rx.clone();
                    let attempt = creds.clone();
                    tokio::spawn(async move {
                        coordinator.rebind(entry_ref, target, conn, attempt, tx, mine).await;
                    });
                    wait_outcome(rx).await?;

                    // a reset may have discarded the re-bound connection
                    let bound = entry
                        .session(idx)
                        .is_some_and(|s| s.bound_dn() == Some(&creds.dn));
                    if bound {
                        return Ok(());
                    }
                    debug!(target_idx = idx, dn = %creds.dn, "Re-bind superseded, binding again");
                }
            }
        }
    }

    /// Taint the session for `idx` and close its connection
    pub fn reset_session(&self, entry: &PoolEntry, idx: usize) {
        let stale = entry.session(idx).and_then(|mut s| s.taint());
        if stale.is_some() {
            info!(target_idx = idx, entry = %entry.id(), "Session reset");
        }
        close_all(stale.into_iter().collect());
    }

    async fn handshake(
        &self,
        entry: Arc<PoolEntry>,
        target: Arc<Target>,
        identity: BindIdentity,
        tx: watch::Sender<Option<Result<()>>>,
        mine: OutcomeReceiver,
    ) {
        let idx = target.index;
        let result = self.open(&target, &identity).await;

        let mut stale = Vec::new();
        let outcome = match entry.session(idx) {
            None => Err(MetaError::Internal(format!("no session slot {}", idx))),
            // reset while in flight; the session belongs to a newer attempt
            Some(session) if !session.is_pending_on(&mine) => {
                drop(session);
                debug!(target_idx = idx, entry = %entry.id(), "Handshake superseded, discarding connection");
                match result {
                    Ok((conn, _)) => {
                        stale.push(conn);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Some(mut session) => match result {
                Ok((conn, bound)) => {
                    let next = match bound {
                        Some(dn) => SessionState::Bound { conn, dn },
                        None => SessionState::Anonymous { conn },
                    };
                    session.transition(next);
                    Ok(())
                }
                Err(e) => {
                    session.transition(SessionState::Absent);
                    if e.class() == ErrorClass::Credentials {
                        session.credentials = None;
                    }
                    Err(e)
                }
            },
        };
        close_all(stale);

        match &outcome {
            Ok(()) => debug!(target_idx = idx, entry = %entry.id(), "Session established"),
            Err(e) => warn!(target_idx = idx, entry = %entry.id(), "Session handshake failed: {}", e),
        }
        self.quarantine.report(idx, &outcome);
        tx.send_replace(Some(outcome));
    }

    async fn rebind(
        &self,
        entry: Arc<PoolEntry>,
        target: Arc<Target>,
        conn: Arc<dyn DirectoryConnection>,
        creds: Credentials,
        tx: watch::Sender<Option<Result<()>>>,
        mine: OutcomeReceiver,
    ) {
        let idx = target.index;
        let identity = BindIdentity::Client(creds.clone());
        let result = self.bind_on(&target, conn.as_ref(), &identity).await;

        let mut stale = Vec::new();
        let outcome = match entry.session(idx) {
            None => Err(MetaError::Internal(format!("no session slot {}", idx))),
            Some(session) if !session.is_pending_on(&mine) => {
                drop(session);
                debug!(target_idx = idx, dn = %creds.dn, "Re-bind superseded by a session reset");
                result.map(|_| ())
            }
            Some(mut session) => match result {
                Ok(_) => {
                    session.credentials = Some(creds.clone());
                    session.transition(SessionState::Bound {
                        conn,
                        dn: creds.dn.clone(),
                    });
                    Ok(())
                }
                Err(e) if e.is_transport() => {
                    session.credentials = None;
                    stale.extend(session.transition(SessionState::Absent));
                    Err(e)
                }
                Err(e) => {
                    session.credentials = None;
                    session.transition(SessionState::Anonymous { conn });
                    Err(e)
                }
            },
        };
        close_all(stale);

        match &outcome {
            Ok(()) => info!(target_idx = idx, dn = %creds.dn, "Session re-bound"),
            Err(e) => warn!(target_idx = idx, dn = %creds.dn, "Session re-bind failed: {}", e),
        }
        self.quarantine.report(idx, &outcome);
        tx.send_replace(Some(outcome));
    }

    /// Connect to the first reachable URI of `target` and bind on it
    async fn open(
        &self,
        target: &Target,
        identity: &BindIdentity,
    ) -> Result<(Arc<dyn DirectoryConnection>, Option<Dn>)> {
        let mut last_err = MetaError::ServerDown(format!("target {} has no URIs", target.name));

        for uri in &target.uris {
            let params = ConnectParams::for_target(target, uri);
            let conn = match timeout(target.network_timeout, self.connector.connect(&params)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) if e.is_transport() => {
                    warn!(target_idx = target.index, uri = %uri, "Connect failed: {}", e);
                    last_err = e;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(target_idx = target.index, uri = %uri, "Connect timed out");
                    last_err = MetaError::NetworkTimeout(format!("{}: connect timed out", uri));
                    continue;
                }
            };

            match self.bind_on(target, conn.as_ref(), identity).await {
                Ok(bound) => {
                    info!(
                        target_idx = target.index,
                        uri = %uri,
                        dn = %bound.as_ref().map(Dn::as_str).unwrap_or(""),
                        "Connected to target"
                    );
                    return Ok((conn, bound));
                }
                Err(e) => {
                    conn.close().await;
                    if !e.is_transport() {
                        return Err(e);
                    }
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Bind on an open connection, retrying timed-out attempts.
    ///
    /// Returns the DN the session is now bound as, `None` when anonymous.
    async fn bind_on(
        &self,
        target: &Target,
        conn: &dyn DirectoryConnection,
        identity: &BindIdentity,
    ) -> Result<Option<Dn>> {
        let (creds, remote_dn) = match identity {
            BindIdentity::Anonymous => return Ok(None),
            BindIdentity::Proxy(creds) => (creds, creds.dn.clone()),
            BindIdentity::Client(creds) => (
                creds,
                self.rewriter.rewrite(target.index, RewriteContext::BindDn, &creds.dn)?,
            ),
        };

        let mut attempt = 0;
        loop {
            match timeout(
                target.bind_timeout,
                conn.simple_bind(remote_dn.as_str(), creds.password.as_str()),
            )
            .await
            {
                Ok(Ok(())) => return Ok(Some(creds.dn.clone())),
                Ok(Err(e)) => return Err(e),
                Err(_) if attempt < target.retries => {
                    attempt += 1;
                    debug!(target_idx = target.index, attempt, "Bind timed out, retrying");
                }
                Err(_) => {
                    return Err(MetaError::NetworkTimeout(format!("{}: bind timed out", conn.uri())));
                }
            }
        }
    }
}

/// Wait for the attempt behind `rx` to publish its outcome
async fn wait_outcome(mut rx: OutcomeReceiver) -> Result<()> {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(published) => (*published).clone(),
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| Err(MetaError::Internal("bind attempt abandoned".into())))
}
