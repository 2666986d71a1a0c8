//! Pool entry identity
//!
//! Requests are grouped onto pool entries by who they run as on the remote
//! side. Anonymous and privileged entries are shared by every client;
//! everything else gets an entry of its own per client connection.

use serde::Serialize;

use crate::config::ProxyAuthzMode;
use crate::dn::Dn;

/// How a pool entry is shared between clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SharingScope {
    /// One entry for every anonymous request
    Anonymous,
    /// One entry for every request run as the proxy identity
    Privileged,
    /// One entry per client connection
    Exclusive(u64),
}

/// Key of a pool entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub scope: SharingScope,
    pub dn: Dn,
}

/// The client on whose behalf a request runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub connection_id: u64,
    /// Bound DN of the client connection; `None` when anonymous
    pub bind_dn: Option<Dn>,
    /// The client is bound as the proxy's root identity
    pub is_root: bool,
    /// Request generated by the server itself
    pub internal: bool,
}

impl Requester {
    pub fn anonymous(connection_id: u64) -> Self {
        Self {
            connection_id,
            bind_dn: None,
            is_root: false,
            internal: false,
        }
    }

    pub fn authenticated(connection_id: u64, dn: Dn) -> Self {
        Self {
            connection_id,
            bind_dn: Some(dn),
            is_root: false,
            internal: false,
        }
    }

    pub fn root(connection_id: u64, dn: Dn) -> Self {
        Self {
            is_root: true,
            ..Self::authenticated(connection_id, dn)
        }
    }

    pub fn internal() -> Self {
        Self {
            connection_id: 0,
            bind_dn: None,
            is_root: false,
            internal: true,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.bind_dn.as_ref().map_or(true, Dn::is_root)
    }
}

impl IdentityKey {
    pub fn anonymous() -> Self {
        Self {
            scope: SharingScope::Anonymous,
            dn: Dn::root(),
        }
    }

    pub fn privileged() -> Self {
        Self {
            scope: SharingScope::Privileged,
            dn: Dn::root(),
        }
    }

    pub fn exclusive(connection_id: u64, dn: Dn) -> Self {
        Self {
            scope: SharingScope::Exclusive(connection_id),
            dn,
        }
    }

    /// Classify a request onto a pool entry key
    pub fn for_request(requester: &Requester, mode: ProxyAuthzMode, is_bind: bool) -> Self {
        let anonymous = requester.is_anonymous();

        let privileged = requester.internal
            || requester.is_root
            || (!anonymous && mode == ProxyAuthzMode::Always)
            || (anonymous && mode == ProxyAuthzMode::Anonymous);
        if privileged {
            return Self::privileged();
        }

        let shared_anonymous = anonymous
            && (mode == ProxyAuthzMode::NoAnonymous || (mode == ProxyAuthzMode::Legacy && !is_bind));
        if shared_anonymous {
            return Self::anonymous();
        }

        Self::exclusive(
            requester.connection_id,
            requester.bind_dn.clone().unwrap_or_default(),
        )
    }

    pub fn is_shared(&self) -> bool {
        !matches!(self.scope, SharingScope::Exclusive(_))
    }

    /// Whether sessions for this key bind with the proxy identity.
    ///
    /// Per-client entries for an authenticated DN assert the client through
    /// the proxy identity unless the client's own credentials are stored.
    pub fn uses_proxy_identity(&self) -> bool {
        match self.scope {
            SharingScope::Privileged => true,
            SharingScope::Anonymous => false,
            SharingScope::Exclusive(_) => !self.dn.is_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Requester {
        Requester::authenticated(7, Dn::parse("uid=u1,ou=people,dc=x").unwrap())
    }

    #[test]
    fn test_legacy_classification() {
        let mode = ProxyAuthzMode::Legacy;
        assert_eq!(
            IdentityKey::for_request(&Requester::anonymous(1), mode, false),
            IdentityKey::anonymous()
        );
        assert_eq!(
            IdentityKey::for_request(&Requester::anonymous(1), mode, true).scope,
            SharingScope::Exclusive(1)
        );
        let key = IdentityKey::for_request(&user(), mode, false);
        assert_eq!(key.scope, SharingScope::Exclusive(7));
        assert_eq!(key.dn.as_str(), "uid=u1,ou=people,dc=x");
    }

    #[test]
    fn test_privileged_modes() {
        assert_eq!(
            IdentityKey::for_request(&user(), ProxyAuthzMode::Always, false),
            IdentityKey::privileged()
        );
        assert_eq!(
            IdentityKey::for_request(&Requester::anonymous(1), ProxyAuthzMode::Anonymous, false),
            IdentityKey::privileged()
        );
        assert_eq!(
            IdentityKey::for_request(&Requester::internal(), ProxyAuthzMode::NoAnonymous, false),
            IdentityKey::privileged()
        );
        let root = Requester::root(3, Dn::parse("cn=manager,dc=x").unwrap());
        assert_eq!(
            IdentityKey::for_request(&root, ProxyAuthzMode::Legacy, false),
            IdentityKey::privileged()
        );
    }

    #[test]
    fn test_no_anonymous_shares_even_binds() {
        assert_eq!(
            IdentityKey::for_request(&Requester::anonymous(9), ProxyAuthzMode::NoAnonymous, true),
            IdentityKey::anonymous()
        );
    }

    #[test]
    fn test_key_ordering_is_total() {
        let mut keys = vec![
            IdentityKey::exclusive(2, Dn::root()),
            IdentityKey::privileged(),
            IdentityKey::anonymous(),
            IdentityKey::exclusive(1, Dn::root()),
        ];
        keys.sort();
        assert_eq!(keys[0], IdentityKey::anonymous());
        assert_eq!(keys[1], IdentityKey::privileged());
        assert_eq!(keys[2].scope, SharingScope::Exclusive(1));
        assert!(IdentityKey::privileged().uses_proxy_identity());
        assert!(!IdentityKey::exclusive(1, Dn::root()).uses_proxy_identity());
    }
}
