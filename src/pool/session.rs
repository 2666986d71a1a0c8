//! One session to one target inside a pool entry
//!
//! The lifecycle is a single tagged state:
//!
//! ```text
//! Absent -> Creating -> Bound | Anonymous -> Tainted
//!                        \_ Binding _/   (re-authentication overlay)
//! ```
//!
//! `Creating` and `Binding` carry the receiver of the in-flight attempt so
//! concurrent callers wait for its outcome instead of starting their own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::error;
use zeroize::Zeroizing;

use crate::dn::Dn;
use crate::transport::DirectoryConnection;
use crate::types::Result;

/// Outcome published by an in-flight handshake or re-bind
pub type BindOutcome = Option<Result<()>>;

/// Receiver side of an in-flight attempt
pub type OutcomeReceiver = watch::Receiver<BindOutcome>;

/// Credentials a client bound with
#[derive(Clone)]
pub struct Credentials {
    pub dn: Dn,
    pub password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(dn: Dn, password: &str) -> Self {
        Self {
            dn,
            password: Zeroizing::new(password.to_string()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("dn", &self.dn.as_str())
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session state
pub enum SessionState {
    Absent,
    Creating {
        done: OutcomeReceiver,
    },
    Bound {
        conn: Arc<dyn DirectoryConnection>,
        dn: Dn,
    },
    Anonymous {
        conn: Arc<dyn DirectoryConnection>,
    },
    Binding {
        conn: Arc<dyn DirectoryConnection>,
        done: OutcomeReceiver,
    },
    Tainted,
}

/// Tag of a [`SessionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Absent,
    Creating,
    Bound,
    Anonymous,
    Binding,
    Tainted,
}

impl SessionStatus {
    /// Allowed transitions
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Absent, Tainted)
                | (Creating, Bound)
                | (Creating, Anonymous)
                | (Creating, Absent)
                | (Creating, Tainted)
                | (Bound, Binding)
                | (Bound, Absent)
                | (Bound, Tainted)
                | (Anonymous, Binding)
                | (Anonymous, Absent)
                | (Anonymous, Tainted)
                | (Binding, Bound)
                | (Binding, Anonymous)
                | (Binding, Absent)
                | (Binding, Tainted)
                | (Tainted, Creating)
                | (Tainted, Absent)
        )
    }
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Absent => SessionStatus::Absent,
            Self::Creating { .. } => SessionStatus::Creating,
            Self::Bound { .. } => SessionStatus::Bound,
            Self::Anonymous { .. } => SessionStatus::Anonymous,
            Self::Binding { .. } => SessionStatus::Binding,
            Self::Tainted => SessionStatus::Tainted,
        }
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound { conn, dn } => f
                .debug_struct("Bound")
                .field("uri", &conn.uri())
                .field("dn", &dn.as_str())
                .finish(),
            Self::Anonymous { conn } | Self::Binding { conn, .. } => f
                .debug_struct(if matches!(self, Self::Anonymous { .. }) { "Anonymous" } else { "Binding" })
                .field("uri", &conn.uri())
                .finish(),
            other => write!(f, "{:?}", other.status()),
        }
    }
}

/// Session to one target
#[derive(Debug)]
pub struct SingleTargetSession {
    state: SessionState,
    /// Client credentials to (re)bind with; `None` binds as proxy or anonymously
    pub credentials: Option<Credentials>,
    created_at: Option<Instant>,
    last_activity: Instant,
}

impl Default for SingleTargetSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleTargetSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Absent,
            credentials: None,
            created_at: None,
            last_activity: Instant::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Move to `next`, returning the connection the old state held if `next`
    /// no longer holds it.
    pub fn transition(&mut self, next: SessionState) -> Option<Arc<dyn DirectoryConnection>> {
        let (from, to) = (self.status(), next.status());
        if !from.can_transition_to(to) {
            error!(from = ?from, to = ?to, "Invalid session transition");
            debug_assert!(false, "invalid session transition {:?} -> {:?}", from, to);
        }

        let now = Instant::now();
        match to {
            SessionStatus::Bound | SessionStatus::Anonymous if from == SessionStatus::Creating => {
                self.created_at = Some(now);
            }
            SessionStatus::Absent | SessionStatus::Tainted => self.created_at = None,
            _ => {}
        }
        self.last_activity = now;

        let old = std::mem::replace(&mut self.state, next);
        let kept = self.connection();
        match old {
            SessionState::Bound { conn, .. }
            | SessionState::Anonymous { conn }
            | SessionState::Binding { conn, .. } => match kept {
                Some(k) if Arc::ptr_eq(&k, &conn) => None,
                _ => Some(conn),
            },
            _ => None,
        }
    }

    /// Ready for requests
    pub fn is_usable(&self) -> bool {
        matches!(self.state, SessionState::Bound { .. } | SessionState::Anonymous { .. })
    }

    /// Receiver of the in-flight attempt, if any
    pub fn pending(&self) -> Option<OutcomeReceiver> {
        match &self.state {
            SessionState::Creating { done } | SessionState::Binding { done, .. } => Some(done.clone()),
            _ => None,
        }
    }

    /// Whether the attempt in flight is the one publishing to `rx`
    pub fn is_pending_on(&self, rx: &OutcomeReceiver) -> bool {
        match &self.state {
            SessionState::Creating { done } | SessionState::Binding { done, .. } => done.same_channel(rx),
            _ => false,
        }
    }

    /// The in-flight attempt's sender is gone without publishing an outcome
    pub fn is_stalled(&self) -> bool {
        match &self.state {
            SessionState::Creating { done } | SessionState::Binding { done, .. } => {
                done.has_changed().is_err() && done.borrow().is_none()
            }
            _ => false,
        }
    }

    /// Transport handle, while one is held
    pub fn connection(&self) -> Option<Arc<dyn DirectoryConnection>> {
        match &self.state {
            SessionState::Bound { conn, .. }
            | SessionState::Anonymous { conn }
            | SessionState::Binding { conn, .. } => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// DN the session is bound as
    pub fn bound_dn(&self) -> Option<&Dn> {
        match &self.state {
            SessionState::Bound { dn, .. } => Some(dn),
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Whether a usable session outlived its idle timeout or lifetime
    pub fn is_expired(&self, now: Instant, idle: Option<Duration>, ttl: Option<Duration>) -> bool {
        if !self.is_usable() {
            return false;
        }
        let idle_out = idle.is_some_and(|d| now.saturating_duration_since(self.last_activity) > d);
        let aged_out = match (ttl, self.created_at) {
            (Some(d), Some(created)) => now.saturating_duration_since(created) > d,
            _ => false,
        };
        idle_out || aged_out
    }

    /// Drop back to `Absent`, handing back the connection to close
    pub fn reset(&mut self) -> Option<Arc<dyn DirectoryConnection>> {
        if self.status() == SessionStatus::Absent {
            return None;
        }
        self.transition(SessionState::Absent)
    }

    /// Mark unusable, handing back the connection to close
    pub fn taint(&mut self) -> Option<Arc<dyn DirectoryConnection>> {
        if self.status() == SessionStatus::Tainted {
            return None;
        }
        self.credentials = None;
        self.transition(SessionState::Tainted)
    }
}
